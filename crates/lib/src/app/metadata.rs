//! Control-file protocol: keeping the manifest and digest files current and trusted.
//!
//! Control files are downloaded into `<name>_new`, checked against their detached signature
//! when certificates are configured, and only then renamed over the production copy. Digest
//! files always precede the manifest, so an interrupted refresh leaves a manifest that still
//! names the old version and the next run starts over.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use super::{AppError, Application, versioned_app_base};
use crate::config::{Config, ParseOpts};
use crate::consts::{CONFIG_FILE, NEW_SUFFIX, SIGNATURE_SUFFIX, VERSION_FILE};
use crate::digest::{Digest, DigestVersion};
use crate::progress::NoProgress;
use crate::signature::verify_signature;
use crate::status::StatusDisplay;

/// The digest version whose file is loaded for validation.
const LOADED_DIGEST: DigestVersion = DigestVersion::V2;

impl Application {
  /// Downloads control file `path` from the versioned appbase into `<path>_new`.
  async fn download_file(&self, path: &str) -> Result<PathBuf, AppError> {
    let target = self.local_path(&format!("{path}{NEW_SUFFIX}"));
    let url = self.remote_url(path)?;
    info!(path, url = %url, "fetching control file");
    self.connector.download(&url, &target).await?;
    Ok(target)
  }

  /// Fetches, optionally verifies, and installs control file `path`.
  ///
  /// With `sig_version > 0` and certificates configured, `<path>.sig` is fetched too and must
  /// validate against one of them; otherwise both staged files are discarded and the production
  /// copy is left alone.
  ///
  /// # Errors
  ///
  /// Returns an error if a download fails, the signature does not validate or the staged file
  /// cannot be moved into place.
  pub async fn download_control_file(&self, path: &str, sig_version: u32) -> Result<(), AppError> {
    let target = self.download_file(path).await?;

    if sig_version > 0 {
      if self.env.certs.is_empty() {
        info!(path, "no signing certificates, not verifying");
      } else {
        let signature = match self.download_file(&format!("{path}{SIGNATURE_SUFFIX}")).await {
          Ok(signature) => signature,
          Err(e) => {
            remove_quietly(&target);
            return Err(e);
          }
        };
        verify_signature(&self.env.certs, &signature, &target)?;
      }
    }

    let original = self.local_path(path);
    fs::rename(&target, &original).map_err(|source| AppError::Io {
      path: original.clone(),
      source,
    })?;
    Ok(())
  }

  /// Refreshes every digest file version, oldest first.
  ///
  /// # Errors
  ///
  /// Returns the first failure; later versions are not fetched.
  pub async fn download_digest_files(&self) -> Result<(), AppError> {
    for version in DigestVersion::ALL {
      self.download_control_file(version.file_name(), version.number()).await?;
    }
    Ok(())
  }

  /// Refreshes the manifest. It is trusted through its digest entry, not a signature.
  ///
  /// # Errors
  ///
  /// Returns an error if the download or install fails.
  pub async fn download_config_file(&self) -> Result<(), AppError> {
    self.download_control_file(CONFIG_FILE, 0).await
  }

  fn load_digest(&mut self) -> Result<(), AppError> {
    let digest = Digest::load(self.app_dir(), LOADED_DIGEST)?;
    self.digest = Some(Arc::new(digest));
    Ok(())
  }

  /// Brings the control files into a trusted state and works out the target version.
  ///
  /// Returns `true` when the target version differs from the installed one, that is when an
  /// update is due.
  ///
  /// # Errors
  ///
  /// Returns an error when a digest cannot be obtained at all, a control file fails its
  /// signature check, or a re-fetched manifest cannot be applied.
  pub async fn verify_metadata(&mut self, status: &dyn StatusDisplay) -> Result<bool, AppError> {
    info!(
      appbase = %self.vapp_base.as_ref().map(|u| u.to_string()).unwrap_or_default(),
      version = self.version,
      "verifying application"
    );

    if let Err(e) = self.load_digest() {
      info!(error = %e, "failed to load digest, attempting recovery");
      self.digest = None;
    }

    // unversioned installs follow whatever the server currently publishes
    if !self.is_versioned() {
      let old_meta = self
        .digest
        .as_ref()
        .map(|d| d.meta_digest().to_string())
        .unwrap_or_default();
      status.update_status("m.checking");
      let refreshed = match self.download_digest_files().await {
        Ok(()) => self.load_digest(),
        Err(e) => Err(e),
      };
      match refreshed {
        Ok(()) => {
          if self.digest.as_ref().is_some_and(|d| d.meta_digest() != old_meta) {
            info!("unversioned digest changed, revalidating");
            status.update_status("m.validating");
            self.clear_validation_markers();
          }
        }
        Err(e) => warn!(error = %e, "failed to refresh unversioned digest, proceeding"),
      }
    }

    if self.digest.is_none() {
      status.update_status("m.updating_metadata");
      self.download_digest_files().await?;
      self.load_digest()?;
    }

    let config_rsrc = self.config_resource()?;
    if !self.validate_with_digest(&config_rsrc) {
      status.update_status("m.updating_metadata");
      self.download_digest_files().await?;
      self.download_config_file().await?;
      self.load_digest()?;
      self.clear_validation_markers();
      if self.validate_with_digest(&config_rsrc) {
        self.init()?;
      } else {
        warn!("{CONFIG_FILE} failed to validate even after refetching, continuing");
      }
    }

    self.target_version = self.version;
    if self.is_versioned() {
      let file_version = self.read_version_file();
      if file_version >= 0 {
        self.target_version = file_version;
      }
      if let Some(latest) = self.latest.clone() {
        match self.fetch_latest_version(&latest).await {
          Ok(Some(latest_version)) => {
            self.target_version = self.target_version.max(latest_version);
            if file_version >= 0 && self.target_version > file_version {
              self.write_version_file(self.target_version)?;
            }
          }
          Ok(None) => warn!(url = %latest, "latest file names no version"),
          Err(e) => warn!(url = %latest, error = %e, "unable to retrieve latest version"),
        }
      }
    }

    info!(version = self.version, target = self.target_version, "metadata verified");
    Ok(self.version != self.target_version)
  }

  fn validate_with_digest(&self, rsrc: &crate::resource::Resource) -> bool {
    self
      .digest
      .as_ref()
      .is_some_and(|digest| digest.validate_resource(rsrc, &NoProgress))
  }

  async fn fetch_latest_version(&self, url: &reqwest::Url) -> Result<Option<i64>, AppError> {
    let body = self.connector.fetch(url).await?;
    let text = String::from_utf8_lossy(&body);
    let config = Config::parse_str(&text, &ParseOpts::current());
    Ok(config.string("version").and_then(|v| v.trim().parse().ok()))
  }

  /// Points the appbase at the target version and fetches its digests and then its manifest.
  ///
  /// With `allow_offline` a failure is logged, `version.txt` is removed so the next run does not
  /// insist on the unreachable version, and the current install is used as is.
  ///
  /// # Errors
  ///
  /// Returns an error if the target appbase is invalid, or the fetch fails and offline use is
  /// not allowed.
  pub async fn update_metadata(&mut self) -> Result<(), AppError> {
    self.vapp_base = Some(versioned_app_base(
      &self.app_base,
      self.target_version,
      &self.env.host_whitelist,
    )?);

    let fetched = match self.download_digest_files().await {
      Ok(()) => self.download_config_file().await,
      Err(e) => Err(e),
    };
    match fetched {
      Ok(()) => Ok(()),
      Err(e) if self.options.allow_offline => {
        warn!(error = %e, "failed to update metadata, continuing offline");
        let path = self.local_path(VERSION_FILE);
        if let Err(e) = fs::remove_file(&path)
          && e.kind() != io::ErrorKind::NotFound
        {
          warn!(path = %path.display(), error = %e, "failed to remove version file");
        }
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  /// Re-fetches the manifest from the appbase known so far, after the local one proved
  /// unusable.
  ///
  /// # Errors
  ///
  /// Returns an error if no appbase is known or the download fails.
  pub async fn attempt_recovery(&self, status: &dyn StatusDisplay) -> Result<(), AppError> {
    status.update_status("m.updating_metadata");
    self.download_config_file().await
  }
}

fn remove_quietly(path: &std::path::Path) {
  if let Err(e) = fs::remove_file(path)
    && e.kind() != io::ErrorKind::NotFound
  {
    warn!(path = %path.display(), error = %e, "failed to remove");
  }
}

#[cfg(test)]
mod tests {
  use super::super::testutil::app_with_manifest;
  use super::*;
  use crate::digest::create_digests;
  use crate::net::testutil::MapConnector;
  use crate::signature::CertificateSet;
  use crate::status::NoStatus;
  use ed25519_dalek::SigningKey;
  use std::path::Path;
  use tempfile::TempDir;

  const BASE: &str = "http://example.com/app/";

  fn manifest(version: i64) -> String {
    format!("appbase = {BASE}%VERSION%\nversion = {version}\ncode = app.jar\n")
  }

  /// Publishes `manifest` plus digests for it into `dir`, as a server root would hold them.
  async fn publish(dir: &Path, manifest: &str, app_jar: &str, key: Option<&SigningKey>) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(CONFIG_FILE), manifest).unwrap();
    fs::write(dir.join("app.jar"), app_jar).unwrap();
    let app = app_with_manifest(dir, manifest, Arc::new(MapConnector::default()));
    create_digests(dir, &app.all_resources().unwrap(), key, 2).await.unwrap();
  }

  #[tokio::test]
  async fn current_install_needs_no_update() {
    let temp = TempDir::new().unwrap();
    publish(temp.path(), &manifest(1), "v1", None).await;

    let mut app = app_with_manifest(temp.path(), &manifest(1), Arc::new(MapConnector::default()));
    assert!(!app.verify_metadata(&NoStatus).await.unwrap());
    assert_eq!(app.target_version(), 1);
    assert!(app.digest().is_some());
  }

  #[tokio::test]
  async fn missing_digest_is_fetched() {
    let server = TempDir::new().unwrap();
    publish(&server.path().join("1"), &manifest(1), "v1", None).await;
    let connector = Arc::new(MapConnector::serving_dir(BASE, server.path()));

    let install = TempDir::new().unwrap();
    let mut app = app_with_manifest(install.path(), &manifest(1), connector.clone());
    assert!(!app.verify_metadata(&NoStatus).await.unwrap());
    assert!(install.path().join("digest2.txt").exists());
    assert_eq!(connector.hits(&format!("{BASE}1/digest.txt")), 1);
  }

  #[tokio::test]
  async fn version_file_and_latest_raise_target() {
    let temp = TempDir::new().unwrap();
    let latest = "http://example.com/latest.txt";
    let text = format!("{}latest = {latest}\n", manifest(1));
    publish(temp.path(), &text, "v1", None).await;
    fs::write(temp.path().join(VERSION_FILE), "2\n").unwrap();

    let connector = Arc::new(MapConnector::new([(latest, "version = 4\n")]));
    let mut app = app_with_manifest(temp.path(), &text, connector);
    assert!(app.verify_metadata(&NoStatus).await.unwrap());
    assert_eq!(app.target_version(), 4);
    assert_eq!(app.read_version_file(), 4);
  }

  #[tokio::test]
  async fn unreachable_latest_is_ignored() {
    let temp = TempDir::new().unwrap();
    let text = format!("{}latest = http://example.com/latest.txt\n", manifest(1));
    publish(temp.path(), &text, "v1", None).await;

    let mut app = app_with_manifest(temp.path(), &text, Arc::new(MapConnector::default()));
    assert!(!app.verify_metadata(&NoStatus).await.unwrap());
  }

  #[tokio::test]
  async fn tampered_manifest_is_refetched() {
    let server = TempDir::new().unwrap();
    publish(&server.path().join("1"), &manifest(1), "v1", None).await;
    let connector = Arc::new(MapConnector::serving_dir(BASE, server.path()));

    let install = TempDir::new().unwrap();
    publish(install.path(), &manifest(1), "v1", None).await;
    let tampered = format!("{}resource = extra.txt\n", manifest(1));
    let mut app = app_with_manifest(install.path(), &tampered, connector);
    assert_eq!(app.resources().len(), 1);

    app.verify_metadata(&NoStatus).await.unwrap();
    assert_eq!(fs::read_to_string(install.path().join(CONFIG_FILE)).unwrap(), manifest(1));
    assert!(app.resources().is_empty());
  }

  #[tokio::test]
  async fn failed_digest_fetch_keeps_local_manifest() {
    let server = TempDir::new().unwrap();
    let root = server.path().join("1");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join(CONFIG_FILE), manifest(1)).unwrap();
    let connector = Arc::new(MapConnector::serving_dir(BASE, server.path()));

    let install = TempDir::new().unwrap();
    publish(install.path(), &manifest(1), "v1", None).await;
    let edited = format!("{}resource = extra.txt\n", manifest(1));
    let mut app = app_with_manifest(install.path(), &edited, connector.clone());

    assert!(app.verify_metadata(&NoStatus).await.is_err());
    assert_eq!(fs::read_to_string(install.path().join(CONFIG_FILE)).unwrap(), edited);
    assert_eq!(connector.hits(&format!("{BASE}1/{CONFIG_FILE}")), 0);
  }

  #[tokio::test]
  async fn unversioned_digest_change_clears_markers() {
    let unversioned = format!("appbase = {BASE}\ncode = app.jar\n");
    let server = TempDir::new().unwrap();
    publish(server.path(), &unversioned, "new", None).await;
    let connector = Arc::new(MapConnector::serving_dir(BASE, server.path()));

    let install = TempDir::new().unwrap();
    publish(install.path(), &unversioned, "old", None).await;
    let app_jar_marker = install.path().join("app.jarv");
    fs::write(&app_jar_marker, "").unwrap();

    let mut app = app_with_manifest(install.path(), &unversioned, connector);
    assert!(!app.verify_metadata(&NoStatus).await.unwrap());
    assert!(!app_jar_marker.exists());
  }

  #[tokio::test]
  async fn signed_digests_are_verified() {
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let server = TempDir::new().unwrap();
    publish(&server.path().join("1"), &manifest(1), "v1", Some(&key)).await;
    let connector = Arc::new(MapConnector::serving_dir(BASE, server.path()));

    let install = TempDir::new().unwrap();
    fs::write(install.path().join(CONFIG_FILE), manifest(1)).unwrap();
    let env = crate::env::EnvConfig::new(install.path())
      .with_certs(CertificateSet::new(vec![key.verifying_key()]));
    let mut app = Application::new(env, connector);
    app.init().unwrap();
    assert!(!app.verify_metadata(&NoStatus).await.unwrap());
    assert!(install.path().join("digest2.txt").exists());
    assert!(!install.path().join("digest2.txt.sig_new").exists());
  }

  #[tokio::test]
  async fn forged_digest_is_rejected() {
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let forger = SigningKey::from_bytes(&[9u8; 32]);
    let server = TempDir::new().unwrap();
    let root = server.path().join("1");
    publish(&root, &manifest(1), "v1", Some(&forger)).await;
    let connector = Arc::new(MapConnector::serving_dir(BASE, server.path()));

    let install = TempDir::new().unwrap();
    fs::write(install.path().join(CONFIG_FILE), manifest(1)).unwrap();
    let env = crate::env::EnvConfig::new(install.path())
      .with_certs(CertificateSet::new(vec![key.verifying_key()]));
    let mut app = Application::new(env, connector);
    app.init().unwrap();

    let err = app.verify_metadata(&NoStatus).await.unwrap_err();
    assert!(matches!(err, AppError::Signature(_)));
    assert!(!install.path().join("digest.txt").exists());
    assert!(!install.path().join("digest.txt_new").exists());
  }

  #[tokio::test]
  async fn offline_update_keeps_current_install() {
    let temp = TempDir::new().unwrap();
    let text = format!("{}allow_offline = true\n", manifest(1));
    publish(temp.path(), &text, "v1", None).await;
    fs::write(temp.path().join(VERSION_FILE), "2\n").unwrap();

    let mut app = app_with_manifest(temp.path(), &text, Arc::new(MapConnector::default()));
    assert!(app.verify_metadata(&NoStatus).await.unwrap());
    app.update_metadata().await.unwrap();
    assert!(!temp.path().join(VERSION_FILE).exists());
    assert_eq!(fs::read_to_string(temp.path().join(CONFIG_FILE)).unwrap(), text);
  }

  #[tokio::test]
  async fn failed_update_propagates_without_offline() {
    let temp = TempDir::new().unwrap();
    publish(temp.path(), &manifest(1), "v1", None).await;
    fs::write(temp.path().join(VERSION_FILE), "2\n").unwrap();

    let mut app = app_with_manifest(temp.path(), &manifest(1), Arc::new(MapConnector::default()));
    assert!(app.verify_metadata(&NoStatus).await.unwrap());
    assert!(matches!(app.update_metadata().await, Err(AppError::Net(_))));
    assert!(temp.path().join(VERSION_FILE).exists());
  }

  #[tokio::test]
  async fn recovery_refetches_manifest() {
    let server = TempDir::new().unwrap();
    fs::write(server.path().join(CONFIG_FILE), format!("appbase = {BASE}\ncode = app.jar\n")).unwrap();
    let connector = Arc::new(MapConnector::serving_dir(BASE, server.path()));

    let install = TempDir::new().unwrap();
    let env = crate::env::EnvConfig::new(install.path()).with_app_base(BASE);
    let mut app = Application::new(env, connector);
    assert!(matches!(app.init(), Err(AppError::MissingCode)));
    app.attempt_recovery(&NoStatus).await.unwrap();
    app.init().unwrap();
    assert_eq!(app.code_resources().len(), 1);
  }
}
