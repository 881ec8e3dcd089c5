//! CLI smoke tests for updraft.
//!
//! These tests verify that every command parses its arguments, runs without panicking and
//! returns an appropriate exit code. None of them reach the network.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the updraft binary, isolated from the caller's environment.
fn updraft_cmd() -> Command {
  let mut cmd: Command = cargo_bin_cmd!("updraft");
  cmd.env_remove("UPDRAFT_APPBASE");
  cmd.env_remove("UPDRAFT_START_DELAY");
  cmd.env_remove("UPDRAFT_HOST_WHITELIST");
  cmd
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  updraft_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  updraft_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("updraft"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["update", "digest", "gc"] {
    updraft_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

#[test]
fn unknown_subcommand_fails() {
  updraft_cmd().arg("launch").assert().failure();
}

// =============================================================================
// update
// =============================================================================

#[test]
fn update_without_manifest_or_appbase_fails() {
  let temp = TempDir::new().unwrap();

  updraft_cmd()
    .arg("update")
    .arg(temp.path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("m.missing_appbase"));
}

#[test]
fn update_rejects_invalid_delay() {
  let temp = TempDir::new().unwrap();

  updraft_cmd()
    .arg("update")
    .arg(temp.path())
    .args(["--delay", "soon"])
    .assert()
    .failure();
}

// =============================================================================
// gc
// =============================================================================

#[test]
fn gc_on_missing_cache_succeeds() {
  let temp = TempDir::new().unwrap();

  updraft_cmd()
    .arg("gc")
    .arg(temp.path().join(".cache"))
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete"));
}
