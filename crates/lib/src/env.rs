//! Process environment: where the install lives and what the host allows.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::signature::CertificateSet;

/// Bootstrap appbase used when no manifest is available yet.
pub const APPBASE_ENV: &str = "UPDRAFT_APPBASE";

/// Default number of concurrent downloads and hashing workers.
pub const THREAD_POOL_SIZE_ENV: &str = "UPDRAFT_THREAD_POOL_SIZE";

/// Comma separated host patterns (with `*` wildcards) URLs must match.
pub const HOST_WHITELIST_ENV: &str = "UPDRAFT_HOST_WHITELIST";

/// Minutes to wait between taking the update lock and starting work.
pub const START_DELAY_ENV: &str = "UPDRAFT_START_DELAY";

/// Worker count: [`THREAD_POOL_SIZE_ENV`] if set to a positive number, else the available
/// parallelism.
pub fn thread_pool_size() -> usize {
  if let Ok(raw) = std::env::var(THREAD_POOL_SIZE_ENV) {
    match raw.trim().parse::<usize>() {
      Ok(n) if n > 0 => return n,
      _ => warn!(value = %raw, "ignoring invalid {THREAD_POOL_SIZE_ENV}"),
    }
  }
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub fn host_whitelist() -> Vec<String> {
  std::env::var(HOST_WHITELIST_ENV)
    .map(|raw| {
      raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
    })
    .unwrap_or_default()
}

pub fn start_delay() -> Duration {
  match std::env::var(START_DELAY_ENV) {
    Ok(raw) => match raw.trim().parse::<u64>() {
      Ok(minutes) => Duration::from_secs(minutes * 60),
      Err(_) => {
        warn!(value = %raw, "ignoring invalid {START_DELAY_ENV}");
        Duration::ZERO
      }
    },
    Err(_) => Duration::ZERO,
  }
}

/// Everything the updater needs from outside the manifest.
#[derive(Debug, Clone)]
pub struct EnvConfig {
  pub app_dir: PathBuf,
  /// Appbase to bootstrap from when the manifest is missing or unusable.
  pub app_base: Option<String>,
  pub certs: CertificateSet,
  pub host_whitelist: Vec<String>,
}

impl EnvConfig {
  /// Creates a config for `app_dir`, taking the bootstrap appbase and host whitelist from the
  /// environment.
  pub fn new(app_dir: impl Into<PathBuf>) -> Self {
    Self {
      app_dir: app_dir.into(),
      app_base: std::env::var(APPBASE_ENV).ok().filter(|s| !s.trim().is_empty()),
      certs: CertificateSet::default(),
      host_whitelist: host_whitelist(),
    }
  }

  pub fn with_app_base(mut self, app_base: impl Into<String>) -> Self {
    self.app_base = Some(app_base.into());
    self
  }

  pub fn with_certs(mut self, certs: CertificateSet) -> Self {
    self.certs = certs;
    self
  }

  pub fn app_dir(&self) -> &Path {
    &self.app_dir
  }
}
