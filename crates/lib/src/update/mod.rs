//! The update orchestrator.
//!
//! [`Updater`] drives an install directory to the state its server publishes and then hands it
//! to a [`Launcher`]. Each pass verifies the control files, updates to a newer version when one
//! is targeted, verifies resources and downloads whatever failed. A pass that finds nothing to
//! fetch and a suitable runtime installs the staged files and launches. Passes are bounded by
//! [`MAX_LOOPS`]; an install that does not converge is reported as unrepairable.
//!
//! Everything that modifies the install directory happens under an [`UpdateLock`]. Fatal errors
//! are reported through [`StatusDisplay::fail`] with the key from [`UpdateError::message_key`].

mod steps;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::app::{AppError, Application};
use crate::consts::{CONFIG_FILE, MAX_LOOPS};
use crate::lock::{LockError, UpdateLock};
use crate::net::download_resources;
use crate::patch::{ArchivePatcher, Patcher};
use crate::progress::ProgressObserver;
use crate::resource::{Resource, ResourceError};
use crate::runtime::{ReleaseFileProbe, RuntimeProbe};
use crate::status::{NoStatus, StatusDisplay, Step, StepTracker};
use crate::verify::{VerifyError, VerifyOptions, verify_resources};

/// Written and removed again to check that the install directory accepts changes.
const WRITE_PROBE_FILE: &str = ".updraft_write_test";

#[derive(Debug, Error)]
pub enum UpdateError {
  #[error("install directory {path} is not writable: {source}")]
  ReadOnly {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("{path} was touched during the startup delay, another instance is starting")]
  ConfigChanged { path: PathBuf },

  #[error(transparent)]
  App(#[from] AppError),

  #[error(transparent)]
  Verify(#[from] VerifyError),

  #[error("no digest available after verifying metadata")]
  MissingDigest,

  #[error("failed to download runtime: {reason}")]
  RuntimeDownload { reason: String },

  #[error("failed to install runtime: {0}")]
  RuntimeInstall(#[source] ResourceError),

  #[error("failed to install {path}: {source}")]
  Install {
    path: String,
    #[source]
    source: ResourceError,
  },

  #[error("unable to bring the application up to date after {passes} passes")]
  UnableToRepair { passes: usize },

  #[error(transparent)]
  Launch(#[from] LaunchError),
}

impl UpdateError {
  /// Status message key reported for this error.
  pub fn message_key(&self) -> &'static str {
    match self {
      UpdateError::ReadOnly { .. } => "m.readonly_error",
      UpdateError::Lock(e) if e.is_contention() => "m.another_instance_running",
      UpdateError::Lock(_) => "m.lock_failed",
      UpdateError::ConfigChanged { .. } => "m.another_instance_running",
      UpdateError::App(e) => e.message_key(),
      UpdateError::Verify(_) => "m.verify_timeout",
      UpdateError::MissingDigest => "m.invalid_digest_file",
      UpdateError::RuntimeDownload { .. } => "m.runtime_download_failed",
      UpdateError::RuntimeInstall(_) => "m.runtime_unpack_failed",
      UpdateError::Install { .. } => "m.install_failed",
      UpdateError::UnableToRepair { .. } => "m.unable_to_repair",
      UpdateError::Launch(_) => "m.launch_failed",
    }
  }
}

#[derive(Debug, Error)]
#[error("launch failed: {message}")]
pub struct LaunchError {
  pub message: String,
}

/// Receives the install once it is up to date.
pub trait Launcher: Send + Sync {
  /// # Errors
  ///
  /// Returns an error if the application could not be started.
  fn launch(&self, app: &Application, outcome: &UpdateOutcome) -> Result<(), LaunchError>;
}

/// Launches nothing; the run ends once the install is current.
pub struct NoLaunch;

impl Launcher for NoLaunch {
  fn launch(&self, _app: &Application, _outcome: &UpdateOutcome) -> Result<(), LaunchError> {
    Ok(())
  }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
  /// Wait this long after taking the lock, giving up if another instance starts meanwhile.
  pub start_delay: Duration,
  /// Launch the install as it is, without contacting the server.
  pub no_update: bool,
  /// Unpack `UNPACK` resources again once per version, recorded in `unpacked.dat`.
  pub check_unpacked: bool,
  /// Recorded in the lock file.
  pub command: String,
}

/// What a successful run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateOutcome {
  pub app_dir: PathBuf,
  pub version: i64,
  pub passes: usize,
  pub already_valid: usize,
  pub downloaded: usize,
  pub installed: usize,
  pub cleaned: Vec<PathBuf>,
  pub cached_code: Vec<PathBuf>,
  pub native_dirs: Vec<PathBuf>,
  pub skipped_update: bool,
}

/// Maps progress within the current step onto overall progress.
#[derive(Clone)]
struct StepProgress {
  tracker: Arc<Mutex<StepTracker>>,
  status: Arc<dyn StatusDisplay>,
}

impl ProgressObserver for StepProgress {
  fn progress(&self, percent: u32) {
    let global = lock_tracker(&self.tracker).global(percent);
    self.status.set_progress(global, None);
  }
}

fn lock_tracker(tracker: &Mutex<StepTracker>) -> MutexGuard<'_, StepTracker> {
  tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Updater {
  app: Application,
  status: Arc<dyn StatusDisplay>,
  patcher: Arc<dyn Patcher>,
  probe: Arc<dyn RuntimeProbe>,
  launcher: Arc<dyn Launcher>,
  options: UpdateOptions,
  tracker: Arc<Mutex<StepTracker>>,
  lock: Option<UpdateLock>,
  /// Staged resources awaiting install, by path.
  to_install: BTreeMap<String, Resource>,
  /// Paths validated, and so unpacked, during this run.
  unpacked: HashSet<String>,
  outcome: UpdateOutcome,
}

impl Updater {
  pub fn new(app: Application) -> Self {
    Self {
      app,
      status: Arc::new(NoStatus),
      patcher: Arc::new(ArchivePatcher),
      probe: Arc::new(ReleaseFileProbe),
      launcher: Arc::new(NoLaunch),
      options: UpdateOptions::default(),
      tracker: Arc::new(Mutex::new(StepTracker::default())),
      lock: None,
      to_install: BTreeMap::new(),
      unpacked: HashSet::new(),
      outcome: UpdateOutcome::default(),
    }
  }

  pub fn with_status(mut self, status: Arc<dyn StatusDisplay>) -> Self {
    self.status = status;
    self
  }

  pub fn with_patcher(mut self, patcher: Arc<dyn Patcher>) -> Self {
    self.patcher = patcher;
    self
  }

  pub fn with_probe(mut self, probe: Arc<dyn RuntimeProbe>) -> Self {
    self.probe = probe;
    self
  }

  pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
    self.launcher = launcher;
    self
  }

  pub fn with_options(mut self, options: UpdateOptions) -> Self {
    self.options = options;
    self
  }

  /// Brings the install up to date and launches it.
  ///
  /// # Errors
  ///
  /// Returns the first fatal error, after reporting its message key to the status display and
  /// releasing the lock.
  pub async fn run(mut self) -> Result<UpdateOutcome, UpdateError> {
    match self.run_inner().await {
      Ok(outcome) => {
        if let Some(lock) = self.lock.take() {
          lock.release();
        }
        Ok(outcome)
      }
      Err(e) => {
        error!(error = %e, key = e.message_key(), "update failed");
        self.status.fail(e.message_key());
        if let Some(lock) = self.lock.take() {
          lock.release();
        }
        Err(e)
      }
    }
  }

  async fn run_inner(&mut self) -> Result<UpdateOutcome, UpdateError> {
    let app_dir = self.app.app_dir().to_path_buf();
    check_writable(&app_dir)?;
    self.outcome.app_dir = app_dir.clone();

    if let Err(e) = self.app.init() {
      warn!(error = %e, "failed to read manifest, attempting recovery");
      self.app.attempt_recovery(self.status.as_ref()).await?;
      self.app.init()?;
    }
    self.reset_percents();
    self.predownload().await;

    if self.options.no_update {
      info!(app_dir = %app_dir.display(), "updates disabled, launching as installed");
      self.outcome.skipped_update = true;
      return self.launch().await;
    }

    self.lock = Some(UpdateLock::acquire(&app_dir, &self.options.command)?);
    let config_path = self.app.local_path(CONFIG_FILE);
    if let Err(e) = touch(&config_path) {
      warn!(path = %config_path.display(), error = %e, "failed to touch manifest");
    }
    if !self.options.start_delay.is_zero() {
      self.wait_start_delay(&app_dir, &config_path).await?;
    }

    for pass in 1..=MAX_LOOPS {
      self.outcome.passes = pass;
      debug!(pass, "starting update pass");

      self.enter(Step::VerifyMetadata, "m.validating");
      if self.app.verify_metadata(self.status.as_ref()).await? {
        info!(
          version = self.app.version(),
          target = self.app.target_version(),
          "newer version targeted"
        );
        self.apply_update().await?;
        continue;
      }

      self.enter(Step::VerifyResources, "m.validating");
      let digest = self.app.digest().cloned().ok_or(UpdateError::MissingDigest)?;
      let options = self.app.options();
      let verify_opts = VerifyOptions {
        concurrency: options.max_concurrent_downloads,
        timeout: options.verify_timeout,
        policy: options.revalidate_policy,
      };
      let report = verify_resources(digest, &self.app.all_active_resources(), &verify_opts, &self.progress()).await?;

      self.outcome.already_valid = self.outcome.already_valid.max(report.already_valid);
      self
        .unpacked
        .extend(report.unpacked.iter().map(|rsrc| rsrc.path().to_string()));
      self.stage(report.to_install);

      if !report.to_download.is_empty() {
        info!(count = report.to_download.len(), "resources need downloading");
        self.stage(report.to_download.clone());
        self.enter(Step::RedownloadResources, "m.downloading");
        self.outcome.downloaded += self.download(&report.to_download).await;
        continue;
      }

      if self.runtime_needs_update() {
        self.enter(Step::UpdateRuntime, "m.updating_runtime");
        self.update_runtime().await?;
        continue;
      }

      if self.options.check_unpacked {
        self.check_unpacked();
      }
      self.install_staged()?;
      self.cleanup();
      return self.launch().await;
    }

    Err(UpdateError::UnableToRepair { passes: MAX_LOOPS })
  }

  /// Sleeps with the lock released; an instance started meanwhile touches the manifest, and then
  /// this one gives way.
  async fn wait_start_delay(&mut self, app_dir: &Path, config_path: &Path) -> Result<(), UpdateError> {
    let before = modified(config_path);
    if let Some(lock) = self.lock.take() {
      lock.release();
    }
    info!(delay = ?self.options.start_delay, "delaying start");
    tokio::time::sleep(self.options.start_delay).await;

    if modified(config_path) > before {
      return Err(UpdateError::ConfigChanged {
        path: config_path.to_path_buf(),
      });
    }
    self.lock = Some(UpdateLock::acquire(app_dir, &self.options.command)?);
    Ok(())
  }

  fn reset_percents(&self) {
    lock_tracker(&self.tracker).set_percents(self.app.step_percents().clone());
  }

  fn enter(&self, step: Step, message: &str) {
    debug!(%step, message, "entering step");
    lock_tracker(&self.tracker).set_step(step);
    self.status.update_status(message);
  }

  fn progress(&self) -> StepProgress {
    StepProgress {
      tracker: self.tracker.clone(),
      status: self.status.clone(),
    }
  }

  fn stage(&mut self, resources: Vec<Resource>) {
    for rsrc in resources {
      self.to_install.insert(rsrc.path().to_string(), rsrc);
    }
  }

  /// Downloads `resources` and returns how many arrived.
  async fn download(&self, resources: &[Resource]) -> usize {
    let report = download_resources(
      self.app.connector(),
      resources,
      self.app.options().max_concurrent_downloads,
      &self.progress(),
    )
    .await;
    report.downloaded.len()
  }

  fn runtime_needs_update(&self) -> bool {
    let requirement = self.app.runtime();
    if !requirement.is_required() {
      return false;
    }
    match self.probe.current_version(self.app.app_dir(), requirement) {
      Some(current) => !requirement.is_satisfied_by(Some(&current)),
      // nothing installed locally; fetch one if the manifest says where from
      None => requirement.location.is_some(),
    }
  }
}

fn check_writable(app_dir: &Path) -> Result<(), UpdateError> {
  let err = |source| UpdateError::ReadOnly {
    path: app_dir.to_path_buf(),
    source,
  };
  fs::create_dir_all(app_dir).map_err(err)?;
  let probe = app_dir.join(WRITE_PROBE_FILE);
  fs::write(&probe, b"").map_err(err)?;
  fs::remove_file(&probe).map_err(err)
}

fn touch(path: &Path) -> io::Result<()> {
  fs::File::options().write(true).open(path)?.set_modified(SystemTime::now())
}

fn modified(path: &Path) -> Option<SystemTime> {
  fs::metadata(path).and_then(|m| m.modified()).ok()
}
