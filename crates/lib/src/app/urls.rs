//! Appbase and resource URL construction.

use reqwest::Url;

use super::AppError;

/// Percent-encodes a manifest path for use in a URL, keeping `/` separators.
pub fn encode_path(path: &str) -> String {
  let mut out = String::with_capacity(path.len());
  for byte in path.bytes() {
    match byte {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' | b'~' | b'/' => out.push(byte as char),
      _ => out.push_str(&format!("%{byte:02X}")),
    }
  }
  out
}

/// Replaces `%ENV.NAME%` references with the value of environment variable `NAME`.
///
/// References to unset variables are left untouched.
pub fn expand_env(value: &str) -> String {
  const PREFIX: &str = "%ENV.";
  let mut out = String::with_capacity(value.len());
  let mut rest = value;

  while let Some(start) = rest.find(PREFIX) {
    out.push_str(&rest[..start]);
    let after = &rest[start + PREFIX.len()..];
    match after.find('%') {
      Some(end) => {
        let name = &after[..end];
        match std::env::var(name) {
          Ok(val) => out.push_str(&val),
          Err(_) => out.push_str(&rest[start..start + PREFIX.len() + end + 1]),
        }
        rest = &after[end + 1..];
      }
      None => {
        out.push_str(&rest[start..]);
        rest = "";
      }
    }
  }
  out.push_str(rest);
  out
}

/// Builds the URL resources of `version` are fetched from.
///
/// `%VERSION%` in the appbase is replaced unless the app is unversioned (`version < 0`) and a
/// trailing slash is ensured so relative paths resolve beneath it.
///
/// # Errors
///
/// Returns [`AppError::InvalidAppbase`] if the result is not a URL and
/// [`AppError::HostNotAllowed`] if its host is outside a non-empty `whitelist`.
pub fn versioned_app_base(app_base: &str, version: i64, whitelist: &[String]) -> Result<Url, AppError> {
  let mut base = if version < 0 {
    app_base.to_string()
  } else {
    app_base.replace("%VERSION%", &version.to_string())
  };
  if !base.ends_with('/') {
    base.push('/');
  }
  let url = Url::parse(&base).map_err(|e| AppError::InvalidAppbase {
    appbase: base.clone(),
    message: e.to_string(),
  })?;
  check_host(&url, whitelist)?;
  Ok(url)
}

/// Rejects `url` unless its host matches a pattern in `whitelist`. An empty whitelist allows
/// every host.
///
/// # Errors
///
/// Returns [`AppError::HostNotAllowed`] when no pattern matches.
pub fn check_host(url: &Url, whitelist: &[String]) -> Result<(), AppError> {
  if whitelist.is_empty() {
    return Ok(());
  }
  let host = url.host_str().unwrap_or_default();
  if whitelist.iter().any(|pattern| host_matches(pattern, host)) {
    Ok(())
  } else {
    Err(AppError::HostNotAllowed { url: url.to_string() })
  }
}

/// Case-insensitive match of `host` against `pattern`, where `*` matches any run of characters.
fn host_matches(pattern: &str, host: &str) -> bool {
  let pattern = pattern.to_ascii_lowercase();
  let host = host.to_ascii_lowercase();
  let parts: Vec<&str> = pattern.split('*').collect();
  if parts.len() == 1 {
    return pattern == host;
  }

  let (first, last) = (parts[0], parts[parts.len() - 1]);
  if !host.starts_with(first) || host.len() < first.len() + last.len() || !host.ends_with(last) {
    return false;
  }
  let mut middle = &host[first.len()..host.len() - last.len()];
  for part in &parts[1..parts.len() - 1] {
    match middle.find(part) {
      Some(idx) => middle = &middle[idx + part.len()..],
      None => return false,
    }
  }
  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn encodes_spaces_and_reserved_characters() {
    assert_eq!(encode_path("lib/app.jar"), "lib/app.jar");
    assert_eq!(encode_path("my docs/read me+.txt"), "my%20docs/read%20me%2B.txt");
    assert_eq!(encode_path("a#b?c"), "a%23b%3Fc");
    assert_eq!(encode_path("naïve"), "na%C3%AFve");
  }

  #[test]
  fn versioned_base_substitutes_version() {
    let url = versioned_app_base("http://example.com/app/%VERSION%", 42, &[]).unwrap();
    assert_eq!(url.as_str(), "http://example.com/app/42/");
  }

  #[test]
  fn unversioned_base_is_left_alone() {
    let url = versioned_app_base("http://example.com/app/", -1, &[]).unwrap();
    assert_eq!(url.as_str(), "http://example.com/app/");
  }

  #[test]
  fn invalid_base_is_rejected() {
    assert!(matches!(
      versioned_app_base("not a url", 1, &[]),
      Err(AppError::InvalidAppbase { .. })
    ));
  }

  #[test]
  fn whitelist_wildcards() {
    assert!(host_matches("*.example.com", "downloads.example.com"));
    assert!(host_matches("*.EXAMPLE.com", "a.b.example.com"));
    assert!(!host_matches("*.example.com", "example.com"));
    assert!(host_matches("cdn*.example.*", "cdn3.example.org"));
    assert!(host_matches("example.com", "example.com"));
    assert!(!host_matches("example.com", "evil.com"));
    assert!(!host_matches("a*a", "a"));
  }

  #[test]
  fn whitelist_rejects_foreign_hosts() {
    let whitelist = vec!["*.example.com".to_string()];
    assert!(versioned_app_base("http://cdn.example.com/app/", 1, &whitelist).is_ok());
    assert!(matches!(
      versioned_app_base("http://evil.org/app/", 1, &whitelist),
      Err(AppError::HostNotAllowed { .. })
    ));
  }

  #[test]
  #[serial]
  fn expands_environment_references() {
    temp_env::with_vars([("UPDRAFT_TEST_HOST", Some("mirror.example.com")), ("UPDRAFT_TEST_UNSET", None)], || {
      assert_eq!(
        expand_env("http://%ENV.UPDRAFT_TEST_HOST%/app/"),
        "http://mirror.example.com/app/"
      );
      assert_eq!(expand_env("%ENV.UPDRAFT_TEST_UNSET%/x"), "%ENV.UPDRAFT_TEST_UNSET%/x");
      assert_eq!(expand_env("50%ENV.broken"), "50%ENV.broken");
    });
  }
}
