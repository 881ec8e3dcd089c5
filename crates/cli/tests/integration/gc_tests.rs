use std::time::Duration;

use predicates::prelude::*;

use super::common::TestEnv;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[test]
fn gc_with_empty_cache_succeeds() {
  let env = TestEnv::empty();

  env
    .updraft_cmd()
    .arg("gc")
    .arg(env.path())
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete"));
}

#[test]
fn gc_removes_stale_entries() {
  let env = TestEnv::empty();
  let cached = env.write_file("ab/abcdef.jar", "jar");
  env.write_file("ab/abcdef.jar.lastAccessed", "");
  env.age_file("ab/abcdef.jar.lastAccessed", 10 * DAY);
  let fresh = env.write_file("cd/cdef01.jar", "jar");
  env.write_file("cd/cdef01.jar.lastAccessed", "");

  env
    .updraft_cmd()
    .arg("gc")
    .arg(env.path())
    .args(["--retention-days", "7"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Entries removed: 2"));

  assert!(!cached.exists());
  assert!(fresh.exists());
}

#[test]
fn gc_dry_run_keeps_everything() {
  let env = TestEnv::empty();
  let cached = env.write_file("ab/abcdef.jar", "jar");

  env
    .updraft_cmd()
    .arg("gc")
    .arg(env.path())
    .arg("--dry-run")
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));

  assert!(cached.exists());
}

#[test]
fn gc_json_output_is_valid() {
  let env = TestEnv::empty();

  env
    .updraft_cmd()
    .arg("gc")
    .arg(env.path())
    .args(["-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("files_deleted"))
    .stdout(predicate::str::contains("bytes_freed"))
    .stdout(predicate::str::contains("deleted_paths"));
}

#[test]
fn gc_native_removes_unmarked_bundles() {
  let env = TestEnv::empty();
  env.write_file("0123/natives.zip", "zip");
  env.write_file("0123/libfoo.so", "so");

  env
    .updraft_cmd()
    .arg("gc")
    .arg(env.path())
    .arg("--native")
    .assert()
    .success()
    .stdout(predicate::str::contains("Bundles removed: 1"))
    .stdout(predicate::str::contains("Entries removed: 1"));

  assert!(!env.path().join("0123").exists());
}
