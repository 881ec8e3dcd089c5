use predicates::prelude::*;

use super::common::{TestEnv, manifest};

/// Nothing listens on the discard port, so connections are refused at once.
const UNREACHABLE: &str = "http://127.0.0.1:9/app/%VERSION%";

#[test]
fn update_skipped_launches_install_as_is() {
  let env = TestEnv::with_manifest(&manifest(UNREACHABLE, 1));

  env
    .updraft_cmd()
    .arg("update")
    .arg(env.path())
    .arg("--no-update")
    .assert()
    .success()
    .stdout(predicate::str::contains("Updates disabled"));

  assert!(!env.path().join("updating.lock").exists());
}

#[test]
fn update_json_output_is_valid() {
  let env = TestEnv::with_manifest(&manifest(UNREACHABLE, 3));

  env
    .updraft_cmd()
    .arg("update")
    .arg(env.path())
    .args(["--no-update", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"version\": 3"))
    .stdout(predicate::str::contains("skipped_update"));
}

#[test]
fn update_against_unreachable_server_fails() {
  let env = TestEnv::with_manifest(&manifest(UNREACHABLE, 1));

  env
    .updraft_cmd()
    .arg("update")
    .arg(env.path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("m.download_failed"));

  let manifest_after = std::fs::read_to_string(env.path().join("manifest.txt")).unwrap();
  assert_eq!(manifest_after, manifest(UNREACHABLE, 1));
}

#[test]
fn update_reads_bootstrap_appbase_from_env() {
  let env = TestEnv::empty();

  env
    .updraft_cmd()
    .arg("update")
    .arg(env.path())
    .env("UPDRAFT_APPBASE", "http://127.0.0.1:9/app")
    .assert()
    .failure()
    .stderr(predicate::str::contains("m.download_failed"));
}
