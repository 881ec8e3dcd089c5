//! Manifest configuration.
//!
//! A manifest is a flat list of `key = value` pairs. Keys may repeat, in which case their values
//! accumulate into a multi-value, and values may be restricted to particular platforms with a
//! `[qualifier]` prefix (see [`ParseOpts`]).

mod parse;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

pub use parse::ParseOpts;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// A single configured value, or the accumulated values of a repeated key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
  Single(String),
  Multi(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
  data: BTreeMap<String, ConfigValue>,
}

impl Config {
  /// Reads and parses the config file at `path`.
  ///
  /// If the parsed file sets `strict_comments = true` and `opts` did not already request it,
  /// the file is parsed a second time with strict comment handling.
  ///
  /// # Errors
  ///
  /// Returns [`ConfigError::Read`] if the file cannot be read.
  pub fn parse_file(path: &Path, opts: &ParseOpts) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(Self::parse_str(&text, opts))
  }

  pub fn parse_str(text: &str, opts: &ParseOpts) -> Self {
    let config = Self::from_pairs(parse::parse_pairs(text, opts));
    if !opts.strict_comments && config.bool("strict_comments") {
      let strict = ParseOpts {
        strict_comments: true,
        ..opts.clone()
      };
      return Self::from_pairs(parse::parse_pairs(text, &strict));
    }
    config
  }

  pub fn from_pairs<I, K, V>(pairs: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    let mut config = Config::default();
    for (key, value) in pairs {
      config.insert(key, value);
    }
    config
  }

  /// Adds a value for `key`, turning the entry into a multi-value if the key is already present.
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
    let value = value.into();
    let key = key.into();
    match self.data.remove(&key) {
      None => {
        self.data.insert(key, ConfigValue::Single(value));
      }
      Some(ConfigValue::Single(prev)) => {
        self.data.insert(key, ConfigValue::Multi(vec![prev, value]));
      }
      Some(ConfigValue::Multi(mut values)) => {
        values.push(value);
        self.data.insert(key, ConfigValue::Multi(values));
      }
    }
  }

  pub fn has(&self, key: &str) -> bool {
    self.data.contains_key(key)
  }

  pub fn get(&self, key: &str) -> Option<&ConfigValue> {
    self.data.get(key)
  }

  /// Returns the value for `key`. For a repeated key the first value wins.
  pub fn string(&self, key: &str) -> Option<&str> {
    match self.data.get(key)? {
      ConfigValue::Single(value) => Some(value),
      ConfigValue::Multi(values) => {
        warn!(key, "expected a single value, using the first of several");
        values.first().map(String::as_str)
      }
    }
  }

  /// Returns every value configured for `key`, in file order.
  pub fn multi_value(&self, key: &str) -> Vec<&str> {
    match self.data.get(key) {
      None => Vec::new(),
      Some(ConfigValue::Single(value)) => vec![value.as_str()],
      Some(ConfigValue::Multi(values)) => values.iter().map(String::as_str).collect(),
    }
  }

  /// Splits a single comma separated value into its trimmed, non-empty parts.
  pub fn list(&self, key: &str) -> Vec<String> {
    self
      .string(key)
      .map(|value| {
        value
          .split(',')
          .map(str::trim)
          .filter(|s| !s.is_empty())
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn bool(&self, key: &str) -> bool {
    self
      .string(key)
      .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
  }

  /// Parses the value for `key`, falling back to `default` when it is absent or malformed.
  pub fn parse<T>(&self, key: &str, default: T) -> T
  where
    T: FromStr,
  {
    match self.string(key) {
      None => default,
      Some(raw) => match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
          warn!(key, value = raw, "ignoring malformed config value");
          default
        }
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn repeated_keys_accumulate() {
    let config = Config::from_pairs([("code", "a.jar"), ("code", "b.jar"), ("appbase", "http://x/")]);
    assert_eq!(config.multi_value("code"), vec!["a.jar", "b.jar"]);
    assert_eq!(config.multi_value("appbase"), vec!["http://x/"]);
    assert!(config.multi_value("missing").is_empty());
  }

  #[test]
  fn string_of_multi_value_is_first() {
    let config = Config::from_pairs([("version", "3"), ("version", "4")]);
    assert_eq!(config.string("version"), Some("3"));
  }

  #[test]
  fn list_splits_on_commas() {
    let config = Config::from_pairs([("auxgroups", "extras, , docs ,")]);
    assert_eq!(config.list("auxgroups"), vec!["extras", "docs"]);
  }

  #[test]
  fn parse_falls_back_on_malformed_values() {
    let config = Config::from_pairs([("verify_timeout", "soon"), ("max_concurrent_downloads", " 4 ")]);
    assert_eq!(config.parse("verify_timeout", 60u64), 60);
    assert_eq!(config.parse("max_concurrent_downloads", 1usize), 4);
    assert_eq!(config.parse("absent", -1i64), -1);
  }

  #[test]
  fn bool_is_case_insensitive() {
    let config = Config::from_pairs([("allow_offline", "TRUE"), ("use_code_cache", "yes")]);
    assert!(config.bool("allow_offline"));
    assert!(!config.bool("use_code_cache"));
    assert!(!config.bool("absent"));
  }
}
