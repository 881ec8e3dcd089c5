//! Runtime version requirements.
//!
//! An application may require a minimum (and optionally maximum) version of the runtime it is
//! launched on. When the runtime in use does not qualify, the updater downloads the archive named
//! by `runtime_location` and unpacks it into the install directory.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::Config;
use crate::consts::{DEFAULT_RUNTIME_DIR, RUNTIME_RELEASE_FILE};

/// Reports the version of the runtime the application would be launched on.
pub trait RuntimeProbe: Send + Sync {
  /// The version string of the runtime in use, if one could be determined.
  fn current_version(&self, app_dir: &Path, requirement: &RuntimeRequirement) -> Option<String>;
}

/// Reads the `release` file of the locally installed runtime.
pub struct ReleaseFileProbe;

impl RuntimeProbe for ReleaseFileProbe {
  fn current_version(&self, app_dir: &Path, requirement: &RuntimeRequirement) -> Option<String> {
    read_release_version(&app_dir.join(&requirement.local_dir))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeRequirement {
  /// Encoded minimum version, `0` for no requirement.
  pub min_version: u64,
  /// Encoded maximum version, `0` for none.
  pub max_version: u64,
  /// Require exactly `min_version`.
  pub exact: bool,
  /// Archive path, relative to the versioned appbase, holding the runtime.
  pub location: Option<String>,
  /// Directory, relative to the install dir, the runtime unpacks into.
  pub local_dir: String,
}

impl Default for RuntimeRequirement {
  fn default() -> Self {
    Self {
      min_version: 0,
      max_version: 0,
      exact: false,
      location: None,
      local_dir: DEFAULT_RUNTIME_DIR.to_string(),
    }
  }
}

impl RuntimeRequirement {
  pub fn from_config(config: &Config) -> Self {
    let version_of = |key: &str| config.string(key).and_then(parse_version).unwrap_or(0);
    let min_version = match version_of("runtime_min_version") {
      0 => version_of("runtime_version"),
      v => v,
    };
    Self {
      min_version,
      max_version: version_of("runtime_max_version"),
      exact: config.bool("runtime_exact_version_required"),
      location: config.string("runtime_location").map(str::to_string),
      local_dir: config
        .string("runtime_local_dir")
        .unwrap_or(DEFAULT_RUNTIME_DIR)
        .to_string(),
    }
  }

  pub fn is_required(&self) -> bool {
    self.min_version > 0 || self.max_version > 0
  }

  /// Whether a runtime reporting `current` satisfies the requirement.
  ///
  /// An unknown or unparseable version is accepted, since refusing to run is worse than trying.
  pub fn is_satisfied_by(&self, current: Option<&str>) -> bool {
    if !self.is_required() {
      return true;
    }
    let Some(raw) = current else {
      debug!("runtime version unknown, assuming it qualifies");
      return true;
    };
    let Some(version) = parse_version(raw) else {
      warn!(version = raw, "unable to parse runtime version, assuming it qualifies");
      return true;
    };

    if self.exact {
      return version == self.min_version;
    }
    let min_ok = self.min_version == 0 || version >= self.min_version;
    let max_ok = self.max_version == 0 || version <= self.max_version;
    min_ok && max_ok
  }
}

/// Encodes a dotted version (`17.0.2`, `1.8.0_151`) as one comparable number.
///
/// Up to four numeric components are read; each is given two decimal digits except the last,
/// which is added as is, and missing components count as zero.
pub fn parse_version(raw: &str) -> Option<u64> {
  let parts: Vec<u64> = raw
    .split(|c: char| !c.is_ascii_digit())
    .filter(|p| !p.is_empty())
    .take(4)
    .map(|p| p.parse().ok())
    .collect::<Option<_>>()?;
  if parts.is_empty() {
    return None;
  }

  let mut version = 0u64;
  for index in 0..4 {
    let part = parts.get(index).copied().unwrap_or(0);
    version = version.checked_mul(100)?.checked_add(part)?;
  }
  Some(version)
}

/// Reads `RUNTIME_VERSION="..."` from the release file in `runtime_dir`.
pub fn read_release_version(runtime_dir: &Path) -> Option<String> {
  let text = fs::read_to_string(runtime_dir.join(RUNTIME_RELEASE_FILE)).ok()?;
  text.lines().find_map(|line| {
    let (key, value) = line.split_once('=')?;
    (key.trim() == "RUNTIME_VERSION").then(|| value.trim().trim_matches('"').to_string())
  })
}
