//! The individual steps an [`Updater`] pass runs.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{StepProgress, UpdateError, UpdateOutcome, Updater};
use crate::archive;
use crate::cache::ResourceCache;
use crate::consts::{CODE_CACHE_DIR, CONFIG_FILE, LOCK_FILE, UNPACKED_FILE, UNPACKED_SUFFIX, VERSION_FILE};
use crate::digest::DigestVersion;
use crate::gc;
use crate::net::download_resources;
use crate::progress::ProgressObserver;
use crate::resource::Resource;
use crate::status::Step;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Progress of patch `index` out of `count`, as a share of the whole patch step.
struct PatchProgress {
  inner: StepProgress,
  index: usize,
  count: usize,
}

impl ProgressObserver for PatchProgress {
  fn progress(&self, percent: u32) {
    let done = self.index as u32 * 100 + percent.min(100);
    self.inner.progress(done / self.count.max(1) as u32);
  }
}

#[derive(Default)]
struct CachedCode {
  files: Vec<PathBuf>,
  native_dirs: Vec<PathBuf>,
}

impl Updater {
  /// Fetches `PRELOAD` resources that are missing locally. Failures only cost the preload.
  pub(super) async fn predownload(&mut self) {
    let missing: Vec<Resource> = self
      .app
      .resources()
      .iter()
      .filter(|rsrc| rsrc.should_predownload() && !rsrc.local().exists())
      .cloned()
      .collect();
    if missing.is_empty() {
      return;
    }

    info!(count = missing.len(), "predownloading resources");
    let report = download_resources(
      self.app.connector(),
      &missing,
      self.app.options().max_concurrent_downloads,
      &crate::progress::NoProgress,
    )
    .await;
    if !report.all_succeeded() {
      warn!(failed = report.failed.len(), "some resources could not be predownloaded");
    }
    for rsrc in report.downloaded {
      if let Err(e) = rsrc.install(false) {
        warn!(resource = rsrc.path(), error = %e, "failed to install predownloaded resource");
      }
    }
  }

  /// Moves the install to the targeted version: applies the patches when the server has them,
  /// then fetches the target's control files and reads them.
  pub(super) async fn apply_update(&mut self) -> Result<(), UpdateError> {
    self.app.clear_validation_markers();

    match self.app.patch_resource(None) {
      Some(main) => {
        let mut patches = vec![main];
        for group in self.app.aux_groups() {
          if self.app.is_aux_group_active(&group.name)
            && let Some(patch) = self.app.patch_resource(Some(&group.name))
          {
            patches.push(patch);
          }
        }

        self.enter(Step::Download, "m.downloading");
        self.outcome.downloaded += self.download(&patches).await;
        self.enter(Step::Patch, "m.patching");
        self.apply_patches(&patches).await;
      }
      None => info!("no patch available, updating in full"),
    }

    self.app.update_metadata().await?;
    self.app.init()?;
    self.reset_percents();
    Ok(())
  }

  async fn apply_patches(&self, patches: &[Resource]) {
    for (index, patch) in patches.iter().enumerate() {
      if !patch.local_new().exists() {
        warn!(patch = patch.path(), "patch was not downloaded, skipping");
        continue;
      }
      if let Err(e) = patch.install(false) {
        warn!(patch = patch.path(), error = %e, "failed to install patch");
        patch.erase();
        continue;
      }

      let patcher = self.patcher.clone();
      let app_dir = self.app.app_dir().to_path_buf();
      let file = patch.local().to_path_buf();
      let progress = PatchProgress {
        inner: self.progress(),
        index,
        count: patches.len(),
      };
      let applied = tokio::task::spawn_blocking(move || patcher.patch(&app_dir, &file, &progress)).await;
      match applied {
        Ok(Ok(())) => info!(patch = patch.path(), "patch applied"),
        Ok(Err(e)) => warn!(patch = patch.path(), error = %e, "failed to apply patch"),
        Err(e) => warn!(patch = patch.path(), error = %e, "patch worker failed"),
      }
      patch.erase();
    }
  }

  /// Fetches and unpacks the runtime archive named by the manifest.
  pub(super) async fn update_runtime(&mut self) -> Result<(), UpdateError> {
    let rsrc = self.app.runtime_resource().ok_or_else(|| UpdateError::RuntimeDownload {
      reason: "no runtime_location in manifest".to_string(),
    })?;

    self.status.update_status("m.downloading_runtime");
    let report = download_resources(self.app.connector(), std::slice::from_ref(&rsrc), 1, &self.progress()).await;
    if let Some((_, e)) = report.failed.into_iter().next() {
      return Err(UpdateError::RuntimeDownload { reason: e.to_string() });
    }

    self.status.update_status("m.unpacking_runtime");
    rsrc.install(true).map_err(UpdateError::RuntimeInstall)?;
    info!(runtime = rsrc.path(), "runtime installed");
    Ok(())
  }

  /// Unpacks `UNPACK` resources not unpacked during this run, once per application version.
  pub(super) fn check_unpacked(&self) {
    let path = self.app.local_path(UNPACKED_FILE);
    let recorded: i64 = fs::read_to_string(&path)
      .ok()
      .and_then(|text| text.trim().parse().ok())
      .unwrap_or(-1);
    if recorded >= self.app.version() {
      return;
    }

    self.enter(Step::Unpack, "m.validating");
    for rsrc in self.app.all_active_resources() {
      if !rsrc.should_unpack() || self.unpacked.contains(rsrc.path()) {
        continue;
      }
      match rsrc.unpack() {
        Ok(()) => debug!(resource = rsrc.path(), "unpacked"),
        Err(e) => warn!(resource = rsrc.path(), error = %e, "failed to unpack"),
      }
    }
    if let Err(e) = fs::write(&path, format!("{}\n", self.app.version())) {
      warn!(path = %path.display(), error = %e, "failed to record unpacked version");
    }
  }

  /// Moves every staged download into place.
  pub(super) fn install_staged(&mut self) -> Result<(), UpdateError> {
    let staged = std::mem::take(&mut self.to_install);
    for rsrc in staged.into_values() {
      if !rsrc.local_new().exists() {
        debug!(resource = rsrc.path(), "nothing staged");
        continue;
      }
      rsrc.install(true).map_err(|source| UpdateError::Install {
        path: rsrc.path().to_string(),
        source,
      })?;
      self.outcome.installed += 1;
    }
    Ok(())
  }

  /// Deletes files matching the manifest's cleanup patterns, sparing resources and control
  /// files.
  pub(super) fn cleanup(&mut self) {
    let patterns = &self.app.options().cleanup_patterns;
    if patterns.is_empty() {
      return;
    }

    let mut protected: HashSet<PathBuf> = self
      .app
      .all_active_resources()
      .iter()
      .map(|rsrc| rsrc.local().to_path_buf())
      .collect();
    for name in [CONFIG_FILE, VERSION_FILE, LOCK_FILE, UNPACKED_FILE] {
      protected.insert(self.app.local_path(name));
    }
    for version in DigestVersion::ALL {
      protected.insert(self.app.local_path(version.file_name()));
    }

    let base = glob::Pattern::escape(&self.app.app_dir().to_string_lossy());
    for pattern in patterns {
      let paths = match glob::glob(&format!("{base}/{pattern}")) {
        Ok(paths) => paths,
        Err(e) => {
          warn!(pattern, error = %e, "ignoring invalid cleanup pattern");
          continue;
        }
      };
      for path in paths.flatten() {
        if !path.is_file() || protected.contains(&path) {
          continue;
        }
        match fs::remove_file(&path) {
          Ok(()) => {
            debug!(path = %path.display(), "cleaned up");
            self.outcome.cleaned.push(path);
          }
          Err(e) => warn!(path = %path.display(), error = %e, "failed to clean up"),
        }
      }
    }
  }

  /// Copies code resources into the content-addressed cache, unpacks native bundles next to
  /// their cached archive, and collects whatever has not been used within the retention period.
  async fn cache_code(&mut self) {
    let Some(digest) = self.app.digest().cloned() else {
      return;
    };
    let hashed = |rsrc: &Resource| digest.get(rsrc.path()).map(|hash| (rsrc.local().to_path_buf(), hash.to_string()));
    let code: Vec<(PathBuf, String)> = self.app.active_code_resources().iter().filter_map(hashed).collect();
    let natives: Vec<(PathBuf, String)> = self
      .app
      .active_resources()
      .iter()
      .filter(|rsrc| rsrc.is_native())
      .filter_map(hashed)
      .collect();

    let cache = ResourceCache::new(self.app.local_path(CODE_CACHE_DIR));
    let retention = DAY * self.app.options().code_cache_retention_days as u32;

    let cached = tokio::task::spawn_blocking(move || {
      let mut cached = CachedCode::default();
      for (local, hash) in code {
        match cache.cache_file(&local, &hash) {
          Ok(path) => cached.files.push(path),
          Err(e) => warn!(error = %e, "failed to cache code resource"),
        }
      }
      for (local, hash) in natives {
        let unpacked = cache
          .cache_bundle(&local, &hash)
          .map_err(|e| e.to_string())
          .and_then(|archive| unpack_bundle(&archive).map_err(|e| e.to_string()));
        match unpacked {
          Ok(dir) => cached.native_dirs.push(dir),
          Err(e) => warn!(resource = %local.display(), error = %e, "failed to cache native bundle"),
        }
      }

      if let Err(e) = gc::collect(cache.root(), retention, false) {
        warn!(error = %e, "code cache collection failed");
      }
      if let Err(e) = gc::collect_native(&cache.native_root(), retention, false) {
        warn!(error = %e, "native cache collection failed");
      }
      cached
    })
    .await;

    match cached {
      Ok(cached) => {
        self.outcome.cached_code = cached.files;
        self.outcome.native_dirs = cached.native_dirs;
      }
      Err(e) => warn!(error = %e, "code cache worker failed"),
    }
  }

  /// Final step: caches code when configured and hands over to the launcher.
  pub(super) async fn launch(&mut self) -> Result<UpdateOutcome, UpdateError> {
    self.enter(Step::Launch, "m.launching");
    if self.app.options().use_code_cache {
      self.cache_code().await;
    }
    self.outcome.version = self.app.version();
    self.launcher.launch(&self.app, &self.outcome)?;
    self.progress().progress(100);
    info!(version = self.outcome.version, passes = self.outcome.passes, "launched");
    Ok(std::mem::take(&mut self.outcome))
  }
}

/// Unpacks a cached native bundle into its directory once, recording that with a sentinel.
fn unpack_bundle(archive: &Path) -> Result<PathBuf, archive::ArchiveError> {
  let dir = archive.parent().map(Path::to_path_buf).unwrap_or_default();
  let mut sentinel = OsString::from(archive.as_os_str());
  sentinel.push(UNPACKED_SUFFIX);
  let sentinel = PathBuf::from(sentinel);

  if !sentinel.exists() {
    archive::unpack(archive, &dir, false)?;
    if let Err(e) = fs::write(&sentinel, b"") {
      warn!(path = %sentinel.display(), error = %e, "failed to record unpacked bundle");
    }
  }
  Ok(dir)
}
