//! Digest files: the trusted record of what every resource should hash to.
//!
//! A digest file lists `path = hash` for each resource in manifest order and ends with a
//! self entry, `digest2.txt = <meta>`, where `<meta>` hashes the concatenation of every preceding
//! `path = hash\n` line. Loading a digest recomputes the meta-digest and rejects the file if it
//! does not match, so a truncated or edited digest is never trusted.

mod compute;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use compute::{DigestVersion, compute_digest, hash_bytes};

use crate::consts::{CONFIG_FILE, SIGNATURE_SUFFIX};
use crate::progress::{NoProgress, ProgressObserver};
use crate::resource::Resource;
use crate::signature::{SignatureError, sign_file};

#[derive(Debug, Error)]
pub enum DigestError {
  #[error("failed to read digest {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("digest file {path} does not match its meta-digest")]
  Invalid { path: PathBuf },

  #[error("failed to hash {path}: {source}")]
  Compute {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write digest {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("digest task failed: {0}")]
  Task(String),

  #[error(transparent)]
  Sign(#[from] SignatureError),
}

/// A loaded and self-verified digest file.
#[derive(Debug, Clone)]
pub struct Digest {
  version: DigestVersion,
  digests: HashMap<String, String>,
  meta_digest: String,
}

impl Digest {
  /// Loads the digest file of `version` from `app_dir`.
  ///
  /// # Errors
  ///
  /// Returns [`DigestError::Read`] if the file cannot be read and [`DigestError::Invalid`] if
  /// its self entry is missing or does not match the recomputed meta-digest.
  pub fn load(app_dir: &Path, version: DigestVersion) -> Result<Self, DigestError> {
    let path = app_dir.join(version.file_name());
    let text = fs::read_to_string(&path).map_err(|source| DigestError::Read {
      path: path.clone(),
      source,
    })?;
    Self::parse(&text, version).ok_or(DigestError::Invalid { path })
  }

  /// Parses digest text, returning `None` if the self entry is absent or wrong.
  pub fn parse(text: &str, version: DigestVersion) -> Option<Self> {
    let self_key = version.file_name();
    let mut digests = HashMap::new();
    let mut data = String::new();

    for line in text.lines() {
      let Some((path, hash)) = line.split_once('=') else {
        continue;
      };
      let (path, hash) = (path.trim(), hash.trim());
      if path.is_empty() || hash.is_empty() {
        continue;
      }
      if path == self_key {
        let meta_digest = hash_bytes(version, data.as_bytes());
        if meta_digest != hash {
          warn!(expected = hash, actual = %meta_digest, "digest meta-digest mismatch");
          return None;
        }
        return Some(Self {
          version,
          digests,
          meta_digest,
        });
      }
      append_entry(&mut data, path, hash);
      digests.insert(path.to_string(), hash.to_string());
    }

    warn!(file = self_key, "digest has no self entry");
    None
  }

  pub fn version(&self) -> DigestVersion {
    self.version
  }

  /// Hash over every entry; changes whenever any resource's digest changes.
  pub fn meta_digest(&self) -> &str {
    &self.meta_digest
  }

  pub fn get(&self, path: &str) -> Option<&str> {
    self.digests.get(path).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.digests.len()
  }

  pub fn is_empty(&self) -> bool {
    self.digests.is_empty()
  }

  /// Whether `rsrc` hashes to its recorded digest.
  ///
  /// A staged `_new` file, when present, is hashed in place of the installed file; a freshly
  /// downloaded resource is thereby judged before it is installed. The manifest is always hashed
  /// in place. Any failure to hash counts as invalid.
  pub fn validate_resource(&self, rsrc: &Resource, progress: &dyn ProgressObserver) -> bool {
    let Some(expected) = self.get(rsrc.path()) else {
      info!(resource = rsrc.path(), "resource missing from digest");
      return false;
    };

    let target = if rsrc.path() != CONFIG_FILE && rsrc.local_new().exists() {
      rsrc.local_new()
    } else {
      rsrc.local()
    };

    match compute_digest(self.version, target, progress) {
      Ok(actual) if actual == expected => true,
      Ok(actual) => {
        info!(resource = rsrc.path(), expected, actual = %actual, "resource failed digest check");
        false
      }
      Err(e) => {
        debug!(resource = rsrc.path(), error = %e, "resource could not be hashed");
        false
      }
    }
  }
}

fn append_entry(data: &mut String, path: &str, hash: &str) {
  let _ = writeln!(data, "{path} = {hash}");
}

/// Hashes `resources` and writes the digest file of `version` into `app_dir`.
///
/// Hashing runs on the blocking pool, at most `concurrency` files at a time; entries are written
/// in the order given.
///
/// # Errors
///
/// Returns an error if a resource cannot be hashed or the digest cannot be written.
pub async fn create_digest(
  version: DigestVersion,
  app_dir: &Path,
  resources: &[Resource],
  concurrency: usize,
) -> Result<PathBuf, DigestError> {
  let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
  let mut join_set = JoinSet::new();

  for (index, rsrc) in resources.iter().enumerate() {
    let local = rsrc.local().to_path_buf();
    let semaphore = semaphore.clone();
    join_set.spawn(async move {
      let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| DigestError::Task(e.to_string()))?;
      let hashed = tokio::task::spawn_blocking(move || {
        compute_digest(version, &local, &NoProgress).map_err(|source| DigestError::Compute { path: local, source })
      })
      .await
      .map_err(|e| DigestError::Task(e.to_string()))??;
      Ok::<_, DigestError>((index, hashed))
    });
  }

  let mut hashes = vec![String::new(); resources.len()];
  while let Some(joined) = join_set.join_next().await {
    let (index, hash) = joined.map_err(|e| DigestError::Task(e.to_string()))??;
    hashes[index] = hash;
  }

  let mut data = String::new();
  for (rsrc, hash) in resources.iter().zip(&hashes) {
    append_entry(&mut data, rsrc.path(), hash);
  }
  let meta = hash_bytes(version, data.as_bytes());
  append_entry(&mut data, version.file_name(), &meta);

  let path = app_dir.join(version.file_name());
  fs::write(&path, data).map_err(|source| DigestError::Write {
    path: path.clone(),
    source,
  })?;
  info!(path = %path.display(), entries = resources.len(), %version, "wrote digest");
  Ok(path)
}

/// Writes digest files of every version and, given a key, their detached signatures.
///
/// # Errors
///
/// Returns an error if any digest cannot be created or signed.
pub async fn create_digests(
  app_dir: &Path,
  resources: &[Resource],
  signing_key: Option<&SigningKey>,
  concurrency: usize,
) -> Result<Vec<PathBuf>, DigestError> {
  let mut written = Vec::new();
  for version in DigestVersion::ALL {
    let path = create_digest(version, app_dir, resources, concurrency).await?;
    if let Some(key) = signing_key {
      let sig_path = app_dir.join(format!("{}{}", version.file_name(), SIGNATURE_SUFFIX));
      sign_file(key, &path, &sig_path)?;
      info!(path = %sig_path.display(), "signed digest");
      written.push(sig_path);
    }
    written.push(path);
  }
  Ok(written)
}
