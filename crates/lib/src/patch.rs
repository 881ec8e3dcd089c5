//! Incremental patches.
//!
//! A patch moves an install from one version to the next without downloading every resource
//! again. The [`Patcher`] trait is the seam for a real binary-diff format; [`ArchivePatcher`]
//! implements a plain one: a zip whose entries replace files in the install directory, and
//! whose `<path>.delete` entries remove `<path>`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::progress::ProgressObserver;

const DELETE_SUFFIX: &str = ".delete";

#[derive(Debug, Error)]
pub enum PatchError {
  #[error("failed to open patch {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid patch {path}: {source}")]
  Zip {
    path: PathBuf,
    #[source]
    source: ZipError,
  },

  #[error("failed to apply {entry} from {path}: {source}")]
  Apply {
    path: PathBuf,
    entry: String,
    #[source]
    source: io::Error,
  },
}

/// Applies a downloaded patch file to an install directory.
pub trait Patcher: Send + Sync {
  /// # Errors
  ///
  /// Returns an error if the patch cannot be read or applied. Entries already applied are not
  /// rolled back; the following verification pass repairs whatever the patch left behind.
  fn patch(&self, app_dir: &Path, patch_file: &Path, progress: &dyn ProgressObserver) -> Result<(), PatchError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchivePatcher;

impl Patcher for ArchivePatcher {
  fn patch(&self, app_dir: &Path, patch_file: &Path, progress: &dyn ProgressObserver) -> Result<(), PatchError> {
    let file = File::open(patch_file).map_err(|source| PatchError::Open {
      path: patch_file.to_path_buf(),
      source,
    })?;
    let mut zip = ZipArchive::new(file).map_err(|source| PatchError::Zip {
      path: patch_file.to_path_buf(),
      source,
    })?;

    info!(patch = %patch_file.display(), entries = zip.len(), "applying patch");
    let total = zip.len().max(1);

    for index in 0..zip.len() {
      let mut entry = zip.by_index(index).map_err(|source| PatchError::Zip {
        path: patch_file.to_path_buf(),
        source,
      })?;
      let name = entry.name().to_string();
      let apply_err = |source| PatchError::Apply {
        path: patch_file.to_path_buf(),
        entry: name.clone(),
        source,
      };

      let Some(relative) = entry.enclosed_name() else {
        warn!(entry = %name, "skipping patch entry outside of install directory");
        continue;
      };

      if entry.is_dir() {
        fs::create_dir_all(app_dir.join(relative)).map_err(apply_err)?;
      } else if name.ends_with(DELETE_SUFFIX) {
        let target = app_dir.join(relative.with_extension(""));
        match fs::remove_file(&target) {
          Ok(()) => debug!(path = %target.display(), "deleted by patch"),
          Err(e) if e.kind() == io::ErrorKind::NotFound => {}
          Err(e) => return Err(apply_err(e)),
        }
      } else {
        let target = app_dir.join(&relative);
        if let Some(parent) = target.parent() {
          fs::create_dir_all(parent).map_err(apply_err)?;
        }
        let mut out = File::create(&target).map_err(apply_err)?;
        io::copy(&mut entry, &mut out).map_err(apply_err)?;
        debug!(path = %target.display(), "patched");
      }

      progress.progress(((index + 1) * 100 / total) as u32);
    }
    Ok(())
  }
}
