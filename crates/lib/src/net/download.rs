//! Bounded-concurrency resource downloads.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::{Connector, NetError};
use crate::progress::ProgressObserver;
use crate::resource::Resource;

/// Outcome of a batch of downloads.
#[derive(Debug, Default)]
pub struct DownloadReport {
  pub downloaded: Vec<Resource>,
  pub failed: Vec<(Resource, NetError)>,
}

impl DownloadReport {
  pub fn all_succeeded(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Downloads every resource into its staged `_new` file, at most `concurrency` at a time.
///
/// A failed download does not stop the others; it is logged and listed in the report, and the
/// resource is picked up again by the next verification pass. Progress is reported as the
/// share of resources finished.
pub async fn download_resources(
  connector: Arc<dyn Connector>,
  resources: &[Resource],
  concurrency: usize,
  progress: &dyn ProgressObserver,
) -> DownloadReport {
  let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
  let mut join_set = JoinSet::new();

  info!(count = resources.len(), concurrency, "downloading resources");
  progress.progress(0);

  for rsrc in resources {
    let rsrc = rsrc.clone();
    let connector = connector.clone();
    let semaphore = semaphore.clone();

    join_set.spawn(async move {
      // The semaphore is never closed, so acquiring only fails if it is dropped.
      let _permit = semaphore.acquire_owned().await.ok();
      let result = connector.download(rsrc.remote(), rsrc.local_new()).await;
      (rsrc, result)
    });
  }

  let total = resources.len().max(1);
  let mut finished = 0;
  let mut report = DownloadReport::default();

  while let Some(joined) = join_set.join_next().await {
    finished += 1;
    match joined {
      Ok((rsrc, Ok(bytes))) => {
        info!(resource = rsrc.path(), bytes, "downloaded");
        report.downloaded.push(rsrc);
      }
      Ok((rsrc, Err(e))) => {
        if e.is_not_found() {
          warn!(resource = rsrc.path(), url = %rsrc.remote(), "resource missing on server");
        } else {
          warn!(resource = rsrc.path(), error = %e, "download failed");
        }
        report.failed.push((rsrc, e));
      }
      Err(e) => {
        warn!(error = %e, "download task failed");
      }
    }
    progress.progress((finished * 100 / total) as u32);
  }

  report
}
