use predicates::prelude::*;

use super::common::{TestEnv, manifest};

const SECRET_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

#[test]
fn digest_writes_both_versions() {
  let env = TestEnv::with_manifest(&manifest("http://example.com/app/%VERSION%", 1));

  env
    .updraft_cmd()
    .arg("digest")
    .arg(env.path())
    .assert()
    .success()
    .stdout(predicate::str::contains("Digests written"));

  let digest = std::fs::read_to_string(env.path().join("digest2.txt")).unwrap();
  assert!(digest.contains("manifest.txt = "));
  assert!(digest.contains("app.jar = "));
  assert!(env.path().join("digest.txt").exists());
  assert!(!env.path().join("digest2.txt.sig").exists());
}

#[test]
fn digest_signs_with_key() {
  let env = TestEnv::with_manifest(&manifest("http://example.com/app/%VERSION%", 1));
  let key = env.write_file("signing.key", SECRET_KEY);

  env
    .updraft_cmd()
    .arg("digest")
    .arg(env.path())
    .arg("--key")
    .arg(&key)
    .args(["-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("public_key"));

  assert!(env.path().join("digest.txt.sig").exists());
  assert!(env.path().join("digest2.txt.sig").exists());
}

#[test]
fn digest_fails_on_missing_resource() {
  let env = TestEnv::empty();
  env.write_file("manifest.txt", &manifest("http://example.com/app/%VERSION%", 1));

  env.updraft_cmd().arg("digest").arg(env.path()).assert().failure();
}

#[test]
fn digest_fails_without_manifest_code() {
  let env = TestEnv::empty();
  env.write_file("manifest.txt", "appbase = http://example.com/app/\n");

  env
    .updraft_cmd()
    .arg("digest")
    .arg(env.path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to read manifest"));
}
