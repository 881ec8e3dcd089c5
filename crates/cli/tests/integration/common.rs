//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// A manifest for a single code resource served from `appbase`.
pub fn manifest(appbase: &str, version: i64) -> String {
  format!("appbase = {appbase}\nversion = {version}\ncode = app.jar\n")
}

/// Isolated test environment.
///
/// Each test gets its own temporary directory standing in for an install or published
/// directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  /// Create an empty test environment.
  pub fn empty() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Create an environment holding `manifest` and an `app.jar`.
  pub fn with_manifest(manifest: &str) -> Self {
    let env = Self::empty();
    env.write_file("manifest.txt", manifest);
    env.write_file("app.jar", "jar");
    env
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Push the modification time of a file `by` into the past.
  pub fn age_file(&self, relative_path: &str, by: Duration) {
    let file = std::fs::File::options()
      .write(true)
      .open(self.temp.path().join(relative_path))
      .unwrap();
    file.set_modified(SystemTime::now() - by).unwrap();
  }

  /// Get a pre-configured Command for the updraft binary.
  ///
  /// Clears the `UPDRAFT_*` variables so the caller's environment cannot leak in.
  pub fn updraft_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("updraft");
    for var in [
      "UPDRAFT_APPBASE",
      "UPDRAFT_START_DELAY",
      "UPDRAFT_HOST_WHITELIST",
      "UPDRAFT_THREAD_POOL_SIZE",
    ] {
      cmd.env_remove(var);
    }
    cmd
  }
}
