//! The application being kept up to date.
//!
//! An [`Application`] interprets the manifest in its install directory: where resources are
//! served from (the appbase, optionally versioned with `%VERSION%`), which files make up the
//! application, which auxiliary groups are active and how the updater should behave. It also
//! owns the control-file protocol that keeps the manifest and digest files current (see
//! [`Application::verify_metadata`]).

mod metadata;
mod urls;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use urls::{check_host, encode_path, expand_env, versioned_app_base};

use crate::config::{Config, ConfigError, ParseOpts};
use crate::consts::{
  CONFIG_FILE, DEFAULT_CODE_CACHE_RETENTION_DAYS, DEFAULT_VERIFY_TIMEOUT_SECS, OLD_SUFFIX, VERSION_FILE,
};
use crate::digest::{Digest, DigestError};
use crate::env::{EnvConfig, thread_pool_size};
use crate::net::{Connector, NetError};
use crate::resource::{Attr, Resource, attrs};
use crate::runtime::RuntimeRequirement;
use crate::signature::SignatureError;
use crate::status::StepPercents;

#[derive(Debug, Error)]
pub enum AppError {
  #[error(transparent)]
  ReadConfig(#[from] ConfigError),

  #[error("manifest does not define an appbase")]
  MissingAppbase,

  #[error("invalid appbase {appbase}: {message}")]
  InvalidAppbase { appbase: String, message: String },

  #[error("host of {url} is not whitelisted")]
  HostNotAllowed { url: String },

  #[error("manifest lists no code resources")]
  MissingCode,

  #[error("resource path {path:?} must be relative and stay inside the install directory")]
  InvalidResourcePath { path: String },

  #[error("cannot build URL for {path}: {message}")]
  InvalidUrl { path: String, message: String },

  #[error(transparent)]
  Net(#[from] NetError),

  #[error(transparent)]
  Signature(#[from] SignatureError),

  #[error(transparent)]
  Digest(#[from] DigestError),

  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl AppError {
  /// Status message key reported when this error ends an update.
  pub fn message_key(&self) -> &'static str {
    match self {
      AppError::MissingAppbase => "m.missing_appbase",
      AppError::InvalidAppbase { .. } => "m.invalid_appbase",
      AppError::HostNotAllowed { .. } => "m.host_not_allowed",
      AppError::MissingCode => "m.missing_code",
      AppError::ReadConfig(_) | AppError::InvalidResourcePath { .. } | AppError::InvalidUrl { .. } => "m.init_failed",
      AppError::Net(_) => "m.download_failed",
      AppError::Signature(_) => "m.corrupt_digest_signature_error",
      AppError::Digest(_) => "m.invalid_digest_file",
      AppError::Io { .. } => "m.io_error",
    }
  }
}

/// When already validated resources are checked again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RevalidatePolicy {
  /// Hash every resource on every run.
  Always,
  /// Trust validation markers until an update clears them.
  #[default]
  AfterUpdate,
}

impl FromStr for RevalidatePolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "ALWAYS" => Ok(RevalidatePolicy::Always),
      "AFTER_UPDATE" => Ok(RevalidatePolicy::AfterUpdate),
      other => Err(format!("unknown revalidate policy {other}")),
    }
  }
}

/// Updater behaviour read from the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct AppOptions {
  pub allow_offline: bool,
  pub max_concurrent_downloads: usize,
  pub verify_timeout: Duration,
  pub use_code_cache: bool,
  pub code_cache_retention_days: u64,
  pub revalidate_policy: RevalidatePolicy,
  /// Globs, relative to the install dir, of files to delete after a successful update.
  pub cleanup_patterns: Vec<String>,
}

impl Default for AppOptions {
  fn default() -> Self {
    Self {
      allow_offline: false,
      max_concurrent_downloads: thread_pool_size(),
      verify_timeout: Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
      use_code_cache: false,
      code_cache_retention_days: DEFAULT_CODE_CACHE_RETENTION_DAYS,
      revalidate_policy: RevalidatePolicy::default(),
      cleanup_patterns: Vec::new(),
    }
  }
}

impl AppOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      allow_offline: config.bool("allow_offline"),
      max_concurrent_downloads: config.parse("max_concurrent_downloads", thread_pool_size()).max(1),
      verify_timeout: Duration::from_secs(config.parse("verify_timeout", DEFAULT_VERIFY_TIMEOUT_SECS)),
      use_code_cache: config.bool("use_code_cache"),
      code_cache_retention_days: config.parse("code_cache_retention_days", DEFAULT_CODE_CACHE_RETENTION_DAYS),
      revalidate_policy: config.parse("revalidate_policy", RevalidatePolicy::default()),
      cleanup_patterns: config.multi_value("cleanup_pattern").into_iter().map(str::to_string).collect(),
    }
  }
}

/// A named bundle of optional resources, active when `<name>.dat` exists in the install dir.
#[derive(Debug, Clone)]
pub struct AuxGroup {
  pub name: String,
  pub codes: Vec<Resource>,
  pub resources: Vec<Resource>,
}

/// Manifest keys declaring resources, and the attributes each gives them.
const CODE_KEYS: [(&str, Attr); 2] = [("code", Attr::Normal), ("ucode", Attr::Unpack)];
const RESOURCE_KEYS: [(&str, Attr); 5] = [
  ("resource", Attr::Normal),
  ("uresource", Attr::Unpack),
  ("xresource", Attr::Exec),
  ("presource", Attr::Preload),
  ("nresource", Attr::Native),
];

pub struct Application {
  env: EnvConfig,
  connector: Arc<dyn Connector>,
  config: Config,
  app_base: String,
  vapp_base: Option<Url>,
  /// `-1` for an unversioned install.
  version: i64,
  target_version: i64,
  latest: Option<Url>,
  codes: Vec<Resource>,
  resources: Vec<Resource>,
  aux_groups: Vec<AuxGroup>,
  aux_active: Mutex<HashMap<String, bool>>,
  options: AppOptions,
  runtime: RuntimeRequirement,
  step_percents: StepPercents,
  digest: Option<Arc<Digest>>,
}

impl Application {
  /// Creates an uninitialised application; call [`Application::init`] before use.
  pub fn new(env: EnvConfig, connector: Arc<dyn Connector>) -> Self {
    Self {
      env,
      connector,
      config: Config::default(),
      app_base: String::new(),
      vapp_base: None,
      version: -1,
      target_version: -1,
      latest: None,
      codes: Vec::new(),
      resources: Vec::new(),
      aux_groups: Vec::new(),
      aux_active: Mutex::new(HashMap::new()),
      options: AppOptions::default(),
      runtime: RuntimeRequirement::default(),
      step_percents: StepPercents::default(),
      digest: None,
    }
  }

  /// Reads the manifest and (re)initialises everything derived from it.
  ///
  /// The appbase is set up before resources are parsed, so that after a failure caused by a
  /// broken resource list [`Application::attempt_recovery`] can still fetch a fresh manifest.
  ///
  /// # Errors
  ///
  /// Returns an error if the manifest lacks an appbase or code resources, or declares a path or
  /// URL that cannot be used.
  pub fn init(&mut self) -> Result<&Config, AppError> {
    let config = self.read_config();
    self.init_base(&config)?;
    self.runtime = RuntimeRequirement::from_config(&config);
    self.options = AppOptions::from_config(&config);
    self.step_percents = StepPercents::from_config(&config);
    self.init_resources(&config)?;
    self.config = config;
    Ok(&self.config)
  }

  /// Parses the manifest, its backup left by an interrupted replace, or failing both a
  /// bootstrap manifest holding only the appbase from the environment.
  fn read_config(&self) -> Config {
    let opts = ParseOpts::current();
    let primary = self.local_path(CONFIG_FILE);
    let backup = self.local_path(&format!("{CONFIG_FILE}{OLD_SUFFIX}"));

    for path in [&primary, &backup] {
      if !path.exists() {
        continue;
      }
      match Config::parse_file(path, &opts) {
        Ok(config) => return config,
        Err(e) => warn!(path = %path.display(), error = %e, "failed to read manifest"),
      }
    }

    info!(app_dir = %self.env.app_dir().display(), "no manifest found, bootstrapping from environment");
    let mut config = Config::default();
    if let Some(app_base) = &self.env.app_base {
      config.insert("appbase", app_base.as_str());
    }
    config
  }

  fn init_base(&mut self, config: &Config) -> Result<(), AppError> {
    self.version = config.parse("version", -1i64);

    let raw = config.string("appbase").ok_or(AppError::MissingAppbase)?;
    let mut app_base = expand_env(raw.trim());
    if !app_base.ends_with('/') {
      app_base.push('/');
    }
    self.vapp_base = Some(versioned_app_base(&app_base, self.version, &self.env.host_whitelist)?);
    self.app_base = app_base;

    self.latest = match config.string("latest") {
      None => None,
      Some(raw) => {
        let latest = expand_env(raw.trim());
        match Url::parse(&latest) {
          Ok(url) => {
            check_host(&url, &self.env.host_whitelist)?;
            Some(url)
          }
          Err(e) => {
            warn!(latest = %latest, error = %e, "ignoring invalid latest URL");
            None
          }
        }
      }
    };
    Ok(())
  }

  fn init_resources(&mut self, config: &Config) -> Result<(), AppError> {
    self.codes.clear();
    self.resources.clear();
    self.aux_groups.clear();

    if !config.has("code") && !config.has("ucode") {
      return Err(AppError::MissingCode);
    }
    self.codes = self.parse_resources(config, "", &CODE_KEYS)?;
    self.resources = self.parse_resources(config, "", &RESOURCE_KEYS)?;

    for name in config.list("auxgroups") {
      let prefix = format!("{name}.");
      let codes = self.parse_resources(config, &prefix, &CODE_KEYS)?;
      let resources = self.parse_resources(config, &prefix, &RESOURCE_KEYS)?;
      self.aux_groups.push(AuxGroup { name, codes, resources });
    }

    debug!(
      codes = self.codes.len(),
      resources = self.resources.len(),
      aux_groups = self.aux_groups.len(),
      "parsed resources"
    );
    Ok(())
  }

  fn parse_resources(&self, config: &Config, prefix: &str, keys: &[(&str, Attr)]) -> Result<Vec<Resource>, AppError> {
    let mut out = Vec::new();
    for (key, attr) in keys {
      for path in config.multi_value(&format!("{prefix}{key}")) {
        out.push(self.create_resource(path, attrs(&[*attr]))?);
      }
    }
    Ok(out)
  }

  /// Creates a resource for `path`, served from the versioned appbase.
  ///
  /// # Errors
  ///
  /// Returns [`AppError::InvalidResourcePath`] for absolute paths or paths leaving the install
  /// directory, and [`AppError::InvalidUrl`] if no URL can be formed.
  pub fn create_resource(&self, path: &str, attrs: crate::resource::Attrs) -> Result<Resource, AppError> {
    check_relative(path)?;
    Ok(Resource::new(path, self.remote_url(path)?, self.local_path(path), attrs))
  }

  /// URL of `path` below the versioned appbase.
  ///
  /// # Errors
  ///
  /// Returns an error before [`Application::init`] has set up the appbase or if the joined URL
  /// is invalid.
  pub fn remote_url(&self, path: &str) -> Result<Url, AppError> {
    let base = self.vapp_base.as_ref().ok_or(AppError::MissingAppbase)?;
    base.join(&encode_path(path)).map_err(|e| AppError::InvalidUrl {
      path: path.to_string(),
      message: e.to_string(),
    })
  }

  pub fn local_path(&self, path: &str) -> PathBuf {
    self.env.app_dir().join(path)
  }

  pub fn app_dir(&self) -> &Path {
    self.env.app_dir()
  }

  pub fn env(&self) -> &EnvConfig {
    &self.env
  }

  pub fn connector(&self) -> Arc<dyn Connector> {
    self.connector.clone()
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn app_base(&self) -> &str {
    &self.app_base
  }

  pub fn vapp_base(&self) -> Option<&Url> {
    self.vapp_base.as_ref()
  }

  pub fn version(&self) -> i64 {
    self.version
  }

  pub fn target_version(&self) -> i64 {
    self.target_version
  }

  pub fn is_versioned(&self) -> bool {
    self.version >= 0
  }

  pub fn options(&self) -> &AppOptions {
    &self.options
  }

  pub fn runtime(&self) -> &RuntimeRequirement {
    &self.runtime
  }

  pub fn step_percents(&self) -> &StepPercents {
    &self.step_percents
  }

  pub fn digest(&self) -> Option<&Arc<Digest>> {
    self.digest.as_ref()
  }

  pub fn code_resources(&self) -> &[Resource] {
    &self.codes
  }

  pub fn resources(&self) -> &[Resource] {
    &self.resources
  }

  pub fn aux_groups(&self) -> &[AuxGroup] {
    &self.aux_groups
  }

  /// The manifest itself, as a resource checked against the digest.
  ///
  /// # Errors
  ///
  /// Returns an error before the appbase is known.
  pub fn config_resource(&self) -> Result<Resource, AppError> {
    self.create_resource(CONFIG_FILE, attrs(&[Attr::Normal]))
  }

  /// Whether auxiliary group `name` is active. The first answer for a name is remembered for
  /// the lifetime of this instance.
  pub fn is_aux_group_active(&self, name: &str) -> bool {
    let mut active = self.aux_active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *active
      .entry(name.to_string())
      .or_insert_with(|| self.local_path(&format!("{name}.dat")).exists())
  }

  pub fn active_code_resources(&self) -> Vec<Resource> {
    let mut out = self.codes.clone();
    for group in self.active_groups() {
      out.extend(group.codes.iter().cloned());
    }
    out
  }

  pub fn active_resources(&self) -> Vec<Resource> {
    let mut out = self.resources.clone();
    for group in self.active_groups() {
      out.extend(group.resources.iter().cloned());
    }
    out
  }

  /// Code and other resources of the main application and every active aux group.
  pub fn all_active_resources(&self) -> Vec<Resource> {
    let mut out = self.active_code_resources();
    out.extend(self.active_resources());
    out
  }

  /// Every resource any digest must cover: the manifest, then code, resources and every aux
  /// group's code and resources, active or not.
  ///
  /// # Errors
  ///
  /// Returns an error before the appbase is known.
  pub fn all_resources(&self) -> Result<Vec<Resource>, AppError> {
    let mut out = vec![self.config_resource()?];
    out.extend(self.codes.iter().cloned());
    out.extend(self.resources.iter().cloned());
    for group in &self.aux_groups {
      out.extend(group.codes.iter().cloned());
      out.extend(group.resources.iter().cloned());
    }
    Ok(out)
  }

  fn active_groups(&self) -> impl Iterator<Item = &AuxGroup> {
    self.aux_groups.iter().filter(|group| self.is_aux_group_active(&group.name))
  }

  /// The incremental patch from the current to the target version, for the main application or
  /// aux group `aux`. `None` when no newer version is targeted.
  pub fn patch_resource(&self, aux: Option<&str>) -> Option<Resource> {
    if self.target_version <= self.version {
      warn!(
        version = self.version,
        target = self.target_version,
        "patch requested for an up to date or unversioned install"
      );
      return None;
    }

    let infix = aux.map(|name| format!("-{name}")).unwrap_or_default();
    let file = format!("patch{infix}{}.dat", self.version);
    let remote = versioned_app_base(&self.app_base, self.target_version, &self.env.host_whitelist)
      .and_then(|base| {
        base.join(&encode_path(&file)).map_err(|e| AppError::InvalidUrl {
          path: file.clone(),
          message: e.to_string(),
        })
      });
    match remote {
      Ok(remote) => Some(Resource::new(&file, remote, self.local_path(&file), attrs(&[Attr::Normal]))),
      Err(e) => {
        warn!(patch = %file, error = %e, "failed to create patch resource");
        None
      }
    }
  }

  /// The archive holding the required runtime, unpacked into the runtime directory.
  pub fn runtime_resource(&self) -> Option<Resource> {
    let location = self.runtime.location.as_deref()?;
    let file_name = location.rsplit('/').next().unwrap_or(location);
    let local = self.local_path(&self.runtime.local_dir).join(file_name);
    match self.remote_url(location) {
      Ok(remote) => Some(Resource::new(location, remote, local, attrs(&[Attr::Unpack, Attr::Clean]))),
      Err(e) => {
        warn!(location, error = %e, "failed to create runtime resource");
        None
      }
    }
  }

  /// Forgets every earlier validation of the active resources.
  pub fn clear_validation_markers(&self) {
    info!("clearing validation markers");
    for rsrc in self.all_active_resources() {
      rsrc.clear_marker();
    }
  }

  /// The version recorded in `version.txt`, or `-1` when absent or unreadable.
  pub fn read_version_file(&self) -> i64 {
    let path = self.local_path(VERSION_FILE);
    match fs::read_to_string(&path) {
      Ok(text) => text.trim().parse().unwrap_or_else(|_| {
        warn!(path = %path.display(), "ignoring malformed version file");
        -1
      }),
      Err(_) => -1,
    }
  }

  /// Records `version` in `version.txt`.
  ///
  /// # Errors
  ///
  /// Returns an error if the file cannot be written.
  pub fn write_version_file(&self, version: i64) -> Result<(), AppError> {
    let path = self.local_path(VERSION_FILE);
    fs::write(&path, format!("{version}\n")).map_err(|source| AppError::Io { path, source })
  }
}

fn check_relative(path: &str) -> Result<(), AppError> {
  let invalid = || AppError::InvalidResourcePath { path: path.to_string() };
  if path.trim().is_empty() || path.starts_with('/') || path.starts_with('\\') {
    return Err(invalid());
  }
  for component in Path::new(path).components() {
    match component {
      Component::Normal(_) | Component::CurDir => {}
      _ => return Err(invalid()),
    }
  }
  Ok(())
}
