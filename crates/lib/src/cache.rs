//! Content-addressed cache of code resources.
//!
//! A cached file lives at `<root>/<first two digest chars>/<digest>.<ext>` next to a
//! `.lastAccessed` marker whose modification time records its last use. Payload and marker
//! always come as a pair; [`crate::gc`] removes either half found alone. Native bundles are kept
//! one per directory, `<root>/native/<digest>/<file>`, so that the unpacked contents travel
//! with the archive.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::consts::{LAST_ACCESSED_SUFFIX, NATIVE_CACHE_DIR};

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("failed to cache {source_path} at {cached}: {source}")]
  Copy {
    source_path: PathBuf,
    cached: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to touch {path}: {source}")]
  Touch {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// The `.lastAccessed` marker belonging to `cached`.
pub fn last_accessed_file(cached: &Path) -> PathBuf {
  let mut name = OsString::from(cached.as_os_str());
  name.push(LAST_ACCESSED_SUFFIX);
  PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct ResourceCache {
  root: PathBuf,
}

impl ResourceCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Directory holding native bundles.
  pub fn native_root(&self) -> PathBuf {
    self.root.join(NATIVE_CACHE_DIR)
  }

  /// Stores a copy of `source` under `digest` and returns the cached path.
  ///
  /// A file already cached under the same digest is not copied again; only its marker is
  /// refreshed.
  ///
  /// # Errors
  ///
  /// Returns an error if the copy or the marker cannot be written.
  pub fn cache_file(&self, source: &Path, digest: &str) -> Result<PathBuf, CacheError> {
    let prefix = digest.get(..2).unwrap_or(digest);
    let file_name = match source.extension() {
      Some(ext) => format!("{digest}.{}", ext.to_string_lossy()),
      None => digest.to_string(),
    };
    let cached = self.root.join(prefix).join(file_name);
    store(source, &cached)?;
    Ok(cached)
  }

  /// Stores a native bundle `source` in its own directory, `<root>/native/<digest>/`, and
  /// returns the cached archive path.
  ///
  /// # Errors
  ///
  /// Returns an error if the copy or the marker cannot be written.
  pub fn cache_bundle(&self, source: &Path, digest: &str) -> Result<PathBuf, CacheError> {
    let file_name = source.file_name().map(OsString::from).unwrap_or_else(|| OsString::from(digest));
    let cached = self.native_root().join(digest).join(file_name);
    store(source, &cached)?;
    Ok(cached)
  }
}

fn store(source: &Path, cached: &Path) -> Result<(), CacheError> {
  let copy_err = |source_err| CacheError::Copy {
    source_path: source.to_path_buf(),
    cached: cached.to_path_buf(),
    source: source_err,
  };

  if cached.exists() {
    debug!(cached = %cached.display(), "already cached");
  } else {
    if let Some(parent) = cached.parent() {
      fs::create_dir_all(parent).map_err(copy_err)?;
    }
    fs::copy(source, cached).map_err(copy_err)?;
    debug!(source = %source.display(), cached = %cached.display(), "cached");
  }

  let marker = last_accessed_file(cached);
  fs::write(&marker, b"").map_err(|source| CacheError::Touch { path: marker, source })
}
