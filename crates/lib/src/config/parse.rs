//! Line parser for manifest text.

use tracing::debug;

/// Controls how manifest text is interpreted.
///
/// Qualified values (`[linux] value`, `[linux-x86_64, macos] value`, `[!windows] value`) are kept
/// only when the qualifier matches `os_name`/`os_arch`. Names follow `std::env::consts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOpts {
  pub os_name: String,
  pub os_arch: String,
  /// Only treat `#` as a comment at the start of a line.
  pub strict_comments: bool,
}

impl ParseOpts {
  /// Options describing the running platform.
  pub fn current() -> Self {
    ParseOpts {
      os_name: std::env::consts::OS.to_string(),
      os_arch: std::env::consts::ARCH.to_string(),
      strict_comments: false,
    }
  }
}

impl Default for ParseOpts {
  fn default() -> Self {
    Self::current()
  }
}

pub(super) fn parse_pairs(text: &str, opts: &ParseOpts) -> Vec<(String, String)> {
  let mut pairs = Vec::new();

  for raw in text.lines() {
    let Some(line) = strip_comment(raw, opts.strict_comments) else {
      continue;
    };
    let Some((key, value)) = line.split_once('=') else {
      continue;
    };
    let key = key.trim();
    let mut value = value.trim();
    if key.is_empty() || value.is_empty() {
      continue;
    }

    if let Some(rest) = value.strip_prefix('[')
      && let Some((quals, remainder)) = rest.split_once(']')
    {
      if !qualifiers_match(quals, opts) {
        debug!(key, qualifiers = quals, "skipping value for another platform");
        continue;
      }
      value = remainder.trim();
    }

    pairs.push((key.to_string(), value.to_string()));
  }

  pairs
}

/// Returns the meaningful part of a line, or `None` when nothing is left.
///
/// Outside strict mode a `#` anywhere starts a comment and `##` stands for a literal `#`.
fn strip_comment(line: &str, strict: bool) -> Option<String> {
  let trimmed = line.trim();
  if trimmed.is_empty() || trimmed.starts_with('#') {
    return None;
  }
  if strict {
    return Some(trimmed.to_string());
  }

  let mut out = String::with_capacity(trimmed.len());
  let mut chars = trimmed.chars().peekable();
  while let Some(c) = chars.next() {
    if c == '#' {
      if chars.peek() == Some(&'#') {
        chars.next();
        out.push('#');
        continue;
      }
      break;
    }
    out.push(c);
  }

  let out = out.trim();
  (!out.is_empty()).then(|| out.to_string())
}

fn qualifiers_match(quals: &str, opts: &ParseOpts) -> bool {
  let mut any_positive = false;
  let mut matched = false;

  for qual in quals.split(',').map(str::trim).filter(|q| !q.is_empty()) {
    if let Some(negated) = qual.strip_prefix('!') {
      if qualifier_matches(negated.trim(), opts) {
        return false;
      }
    } else {
      any_positive = true;
      matched |= qualifier_matches(qual, opts);
    }
  }

  !any_positive || matched
}

fn qualifier_matches(qual: &str, opts: &ParseOpts) -> bool {
  let (os, arch) = match qual.split_once('-') {
    Some((os, arch)) => (os, Some(arch)),
    None => (qual, None),
  };
  let os_matches = opts.os_name.to_lowercase().starts_with(&os.to_lowercase());
  os_matches && arch.is_none_or(|arch| arch.eq_ignore_ascii_case(&opts.os_arch))
}
