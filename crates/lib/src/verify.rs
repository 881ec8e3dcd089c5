//! Concurrent resource verification.
//!
//! Resources are hashed on the blocking pool, at most `concurrency` at a time. Workers never
//! touch shared state: each sends [`Event`]s over one channel and the coordinating task folds
//! them into the [`VerifyReport`] and the aggregate progress. The coordinator waits for each
//! event with a timeout; a silent window of `timeout` means a worker is stuck and the whole pass
//! fails with [`VerifyError::Timeout`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app::RevalidatePolicy;
use crate::digest::Digest;
use crate::progress::{ProgressAggregator, ProgressObserver};
use crate::resource::Resource;

#[derive(Debug, Error)]
pub enum VerifyError {
  #[error("no verification progress for {}s", timeout.as_secs())]
  Timeout { timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
  pub concurrency: usize,
  pub timeout: Duration,
  pub policy: RevalidatePolicy,
}

/// How verification classified the resources it was given.
#[derive(Debug, Default)]
pub struct VerifyReport {
  /// Resources skipped because their marker was already present.
  pub already_valid: usize,
  /// Installed resources validated in this pass; attributes were applied and markers written.
  pub unpacked: Vec<Resource>,
  /// Resources whose staged download is valid and awaits install.
  pub to_install: Vec<Resource>,
  /// Resources missing or failing their digest.
  pub to_download: Vec<Resource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
  Valid,
  Staged,
  Invalid,
}

#[derive(Debug)]
enum Event {
  Progress { index: usize, percent: u32 },
  Done { index: usize, classification: Classification },
}

type Validator = Arc<dyn Fn(&Resource, &dyn ProgressObserver) -> bool + Send + Sync>;

/// Checks `resources` against `digest`.
///
/// # Errors
///
/// Returns [`VerifyError::Timeout`] if no worker reports anything within `opts.timeout`.
pub async fn verify_resources(
  digest: Arc<Digest>,
  resources: &[Resource],
  opts: &VerifyOptions,
  progress: &dyn ProgressObserver,
) -> Result<VerifyReport, VerifyError> {
  let validator: Validator = Arc::new(move |rsrc: &Resource, obs: &dyn ProgressObserver| {
    digest.validate_resource(rsrc, obs)
  });
  verify_with(validator, resources, opts, progress).await
}

async fn verify_with(
  validator: Validator,
  resources: &[Resource],
  opts: &VerifyOptions,
  progress: &dyn ProgressObserver,
) -> Result<VerifyReport, VerifyError> {
  let mut report = VerifyReport::default();

  let pending: Vec<Resource> = resources
    .iter()
    .filter(|rsrc| {
      if opts.policy == RevalidatePolicy::AfterUpdate && rsrc.is_marked_valid() {
        report.already_valid += 1;
        false
      } else {
        true
      }
    })
    .cloned()
    .collect();

  info!(
    total = resources.len(),
    already_valid = report.already_valid,
    checking = pending.len(),
    "verifying resources"
  );
  if pending.is_empty() {
    progress.progress(100);
    return Ok(report);
  }

  let mut aggregator = ProgressAggregator::new(pending.iter().map(Resource::size).collect());
  let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
  let (tx, mut rx) = mpsc::unbounded_channel();
  let mut join_set = JoinSet::new();

  for (index, rsrc) in pending.iter().enumerate() {
    let rsrc = rsrc.clone();
    let tx = tx.clone();
    let semaphore = semaphore.clone();
    let validator = validator.clone();

    join_set.spawn(async move {
      let _permit = semaphore.acquire_owned().await.ok();
      let worker = tokio::task::spawn_blocking(move || {
        let observer = |percent: u32| {
          let _ = tx.send(Event::Progress { index, percent });
        };
        let classification = classify(&rsrc, validator.as_ref(), &observer);
        let _ = tx.send(Event::Done { index, classification });
      });
      if let Err(e) = worker.await {
        warn!(index, error = %e, "verification worker failed");
      }
    });
  }
  drop(tx);

  let mut results: Vec<Option<Classification>> = vec![None; pending.len()];
  let mut remaining = pending.len();

  while remaining > 0 {
    let event = match tokio::time::timeout(opts.timeout, rx.recv()).await {
      Ok(Some(event)) => event,
      // every worker has finished, some without reporting
      Ok(None) => break,
      Err(_) => {
        warn!(timeout_secs = opts.timeout.as_secs(), remaining, "verification stalled");
        join_set.abort_all();
        return Err(VerifyError::Timeout { timeout: opts.timeout });
      }
    };

    match event {
      Event::Progress { index, percent } => {
        if let Some(aggregate) = aggregator.update(index, percent) {
          progress.progress(aggregate);
        }
      }
      Event::Done { index, classification } => {
        if results[index].replace(classification).is_none() {
          remaining -= 1;
        }
        if let Some(aggregate) = aggregator.update(index, 100) {
          progress.progress(aggregate);
        }
      }
    }
  }
  while join_set.join_next().await.is_some() {}

  for (rsrc, result) in pending.into_iter().zip(results) {
    match result.unwrap_or(Classification::Invalid) {
      Classification::Valid => report.unpacked.push(rsrc),
      Classification::Staged => report.to_install.push(rsrc),
      Classification::Invalid => report.to_download.push(rsrc),
    }
  }

  info!(
    valid = report.unpacked.len(),
    to_install = report.to_install.len(),
    to_download = report.to_download.len(),
    "verification complete"
  );
  Ok(report)
}

/// Runs on a blocking worker.
fn classify(
  rsrc: &Resource,
  validator: &(dyn Fn(&Resource, &dyn ProgressObserver) -> bool + Send + Sync),
  progress: &dyn ProgressObserver,
) -> Classification {
  if !validator(rsrc, progress) {
    return Classification::Invalid;
  }
  if rsrc.local_new().exists() {
    return Classification::Staged;
  }
  match rsrc.apply_attrs().and_then(|()| rsrc.mark_as_valid()) {
    Ok(()) => {
      debug!(resource = rsrc.path(), "resource valid");
      Classification::Valid
    }
    Err(e) => {
      warn!(resource = rsrc.path(), error = %e, "failed to finalise valid resource");
      Classification::Invalid
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::digest::{DigestVersion, hash_bytes};
  use crate::progress::NoProgress;
  use crate::resource::attrs;
  use reqwest::Url;
  use std::fs;
  use std::path::Path;
  use std::sync::Mutex;
  use tempfile::TempDir;

  fn resource(dir: &Path, path: &str) -> Resource {
    let remote = Url::parse("http://example.com/app/").unwrap().join(path).unwrap();
    Resource::new(path, remote, dir.join(path), attrs(&[]))
  }

  fn digest_of(entries: &[(&str, &str)]) -> Arc<Digest> {
    let version = DigestVersion::V2;
    let mut text = String::new();
    for (path, content) in entries {
      text.push_str(&format!("{path} = {}\n", hash_bytes(version, content.as_bytes())));
    }
    let meta = hash_bytes(version, text.as_bytes());
    text.push_str(&format!("{} = {meta}\n", version.file_name()));
    Arc::new(Digest::parse(&text, version).unwrap())
  }

  fn opts() -> VerifyOptions {
    VerifyOptions {
      concurrency: 2,
      timeout: Duration::from_secs(10),
      policy: RevalidatePolicy::AfterUpdate,
    }
  }

  #[tokio::test]
  async fn missing_then_downloaded_then_valid() {
    let temp = TempDir::new().unwrap();
    let digest = digest_of(&[("app.jar", "jar contents")]);
    let app_jar = resource(temp.path(), "app.jar");
    let resources = vec![app_jar.clone()];

    let report = verify_resources(digest.clone(), &resources, &opts(), &NoProgress).await.unwrap();
    assert_eq!(report.to_download, resources);

    fs::write(app_jar.local_new(), "jar contents").unwrap();
    let report = verify_resources(digest.clone(), &resources, &opts(), &NoProgress).await.unwrap();
    assert_eq!(report.to_install, resources);
    assert!(!app_jar.is_marked_valid());

    fs::rename(app_jar.local_new(), app_jar.local()).unwrap();
    let report = verify_resources(digest.clone(), &resources, &opts(), &NoProgress).await.unwrap();
    assert_eq!(report.unpacked, resources);
    assert!(app_jar.is_marked_valid());

    let report = verify_resources(digest, &resources, &opts(), &NoProgress).await.unwrap();
    assert_eq!(report.already_valid, 1);
    assert!(report.unpacked.is_empty());
  }

  #[tokio::test]
  async fn always_policy_rehashes_marked_resources() {
    let temp = TempDir::new().unwrap();
    let digest = digest_of(&[("a.txt", "a")]);
    let rsrc = resource(temp.path(), "a.txt");
    fs::write(rsrc.local(), "tampered").unwrap();
    rsrc.mark_as_valid().unwrap();

    let opts = VerifyOptions {
      policy: RevalidatePolicy::Always,
      ..opts()
    };
    let report = verify_resources(digest, std::slice::from_ref(&rsrc), &opts, &NoProgress).await.unwrap();
    assert_eq!(report.already_valid, 0);
    assert_eq!(report.to_download.len(), 1);
  }

  #[tokio::test]
  async fn classifies_mixed_set_with_monotonic_progress() {
    let temp = TempDir::new().unwrap();
    let digest = digest_of(&[("a.txt", "aaaa"), ("b.txt", "bb"), ("c.txt", "c")]);
    let resources: Vec<_> = ["a.txt", "b.txt", "c.txt"].iter().map(|p| resource(temp.path(), p)).collect();
    fs::write(resources[0].local(), "aaaa").unwrap();
    fs::write(resources[1].local(), "wrong").unwrap();

    let seen = Mutex::new(Vec::new());
    let observer = |p: u32| seen.lock().unwrap().push(p);
    let report = verify_resources(digest, &resources, &opts(), &observer).await.unwrap();

    assert_eq!(report.unpacked, vec![resources[0].clone()]);
    assert_eq!(report.to_download, vec![resources[1].clone(), resources[2].clone()]);
    let seen = seen.into_inner().unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last(), Some(&100));
  }

  #[tokio::test]
  async fn stalled_worker_times_out() {
    let temp = TempDir::new().unwrap();
    let resources = vec![resource(temp.path(), "slow.bin")];
    let validator: Validator = Arc::new(|_: &Resource, _: &dyn ProgressObserver| {
      std::thread::sleep(Duration::from_millis(500));
      true
    });
    let opts = VerifyOptions {
      timeout: Duration::from_millis(50),
      ..opts()
    };

    let err = verify_with(validator, &resources, &opts, &NoProgress).await.unwrap_err();
    assert!(matches!(err, VerifyError::Timeout { .. }));
  }

  #[tokio::test]
  async fn empty_set_is_complete() {
    let seen = Mutex::new(Vec::new());
    let observer = |p: u32| seen.lock().unwrap().push(p);
    let report = verify_resources(digest_of(&[]), &[], &opts(), &observer).await.unwrap();
    assert_eq!(report.already_valid, 0);
    assert_eq!(seen.into_inner().unwrap(), vec![100]);
  }
}
