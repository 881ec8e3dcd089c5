//! Application resources.
//!
//! A [`Resource`] pairs a remote URL with a local file. Whether it is known to be valid is
//! recorded by a marker file beside it (`<local>v`); the marker is the only validity flag and is
//! never part of any digest. Downloads land in a staged `<local>_new` file and are moved into
//! place by [`Resource::install`].

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};

use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveError};
use crate::consts::{NEW_SUFFIX, OLD_SUFFIX, VALID_MARKER_SUFFIX};

#[derive(Debug, Error)]
pub enum ResourceError {
  #[error("failed to move {from} to {to}: {source}")]
  Rename {
    from: PathBuf,
    to: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to update marker {path}: {source}")]
  Marker {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to make {path} executable: {source}")]
  Permissions {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Unpack(#[from] ArchiveError),
}

/// Behaviour flags attached to a resource by the manifest key that declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attr {
  Normal,
  /// Extract the archive beside itself after install (`uresource`, `ucode`).
  Unpack,
  /// Mark the file executable after install (`xresource`).
  Exec,
  /// Fetch before the update loop starts (`presource`).
  Preload,
  /// A native library bundle (`nresource`).
  Native,
  /// Remove the directories an archive unpacks into before unpacking.
  Clean,
}

pub type Attrs = BTreeSet<Attr>;

/// Builds an attribute set from a slice.
pub fn attrs(list: &[Attr]) -> Attrs {
  list.iter().copied().collect()
}

#[derive(Debug, Clone)]
pub struct Resource {
  path: String,
  remote: Url,
  local: PathBuf,
  local_new: PathBuf,
  marker: PathBuf,
  attrs: Attrs,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
  let mut name = OsString::from(path.as_os_str());
  name.push(suffix);
  PathBuf::from(name)
}

impl Resource {
  /// Creates a resource for manifest path `path`, fetched from `remote` into `local`.
  pub fn new(path: impl Into<String>, remote: Url, local: PathBuf, attrs: Attrs) -> Self {
    let local_new = with_suffix(&local, NEW_SUFFIX);
    let marker = with_suffix(&local, VALID_MARKER_SUFFIX);
    Self {
      path: path.into(),
      remote,
      local,
      local_new,
      marker,
      attrs,
    }
  }

  /// The path as declared in the manifest; digest entries are keyed by it.
  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn remote(&self) -> &Url {
    &self.remote
  }

  pub fn local(&self) -> &Path {
    &self.local
  }

  /// Where a download is staged before install.
  pub fn local_new(&self) -> &Path {
    &self.local_new
  }

  pub fn marker(&self) -> &Path {
    &self.marker
  }

  pub fn attrs(&self) -> &Attrs {
    &self.attrs
  }

  pub fn has(&self, attr: Attr) -> bool {
    self.attrs.contains(&attr)
  }

  pub fn is_archive(&self) -> bool {
    archive::is_archive(&self.local)
  }

  pub fn should_unpack(&self) -> bool {
    self.has(Attr::Unpack)
  }

  pub fn should_predownload(&self) -> bool {
    self.has(Attr::Preload)
  }

  pub fn is_native(&self) -> bool {
    self.has(Attr::Native)
  }

  /// Size of the staged download if present, else of the installed file, else zero.
  pub fn size(&self) -> u64 {
    fs::metadata(&self.local_new)
      .or_else(|_| fs::metadata(&self.local))
      .map(|m| m.len())
      .unwrap_or(0)
  }

  pub fn is_marked_valid(&self) -> bool {
    self.marker.exists()
  }

  /// Records that the resource has been validated.
  ///
  /// # Errors
  ///
  /// Returns an error if the marker file cannot be created.
  pub fn mark_as_valid(&self) -> Result<(), ResourceError> {
    fs::write(&self.marker, b"").map_err(|source| ResourceError::Marker {
      path: self.marker.clone(),
      source,
    })
  }

  /// Forgets any earlier validation. Failures are logged; a stale marker only costs a
  /// re-validation on the next pass.
  pub fn clear_marker(&self) {
    match fs::remove_file(&self.marker) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => warn!(marker = %self.marker.display(), error = %e, "failed to clear marker"),
    }
  }

  /// Moves the staged download over the local file and applies attributes.
  ///
  /// An existing local file is first moved aside to `<local>_old` and restored if the staged
  /// file cannot be moved in. With `validate` the resource is marked valid afterwards.
  ///
  /// # Errors
  ///
  /// Returns an error if the staged file cannot be moved into place, or if unpacking or setting
  /// permissions fails.
  pub fn install(&self, validate: bool) -> Result<(), ResourceError> {
    info!(resource = %self.path, "installing");
    if let Some(parent) = self.local.parent() {
      fs::create_dir_all(parent).map_err(|source| ResourceError::Rename {
        from: self.local_new.clone(),
        to: self.local.clone(),
        source,
      })?;
    }

    let old = with_suffix(&self.local, OLD_SUFFIX);
    let had_previous = self.local.exists();
    if had_previous {
      fs::rename(&self.local, &old).map_err(|source| ResourceError::Rename {
        from: self.local.clone(),
        to: old.clone(),
        source,
      })?;
    }

    if let Err(source) = fs::rename(&self.local_new, &self.local) {
      if had_previous && let Err(e) = fs::rename(&old, &self.local) {
        warn!(path = %self.local.display(), error = %e, "failed to restore previous file");
      }
      return Err(ResourceError::Rename {
        from: self.local_new.clone(),
        to: self.local.clone(),
        source,
      });
    }

    if had_previous && let Err(e) = fs::remove_file(&old) {
      warn!(path = %old.display(), error = %e, "failed to remove previous file");
    }

    self.apply_attrs()?;
    if validate {
      self.mark_as_valid()?;
    }
    Ok(())
  }

  /// Unpacks or marks executable, according to the resource's attributes.
  ///
  /// # Errors
  ///
  /// Returns an error if unpacking or changing permissions fails.
  pub fn apply_attrs(&self) -> Result<(), ResourceError> {
    if self.should_unpack() {
      self.unpack()?;
    } else if self.has(Attr::Exec) {
      make_executable(&self.local)?;
    }
    Ok(())
  }

  /// Extracts the resource into the directory that holds it.
  ///
  /// # Errors
  ///
  /// Returns an error if the resource is not a readable archive or extraction fails.
  pub fn unpack(&self) -> Result<(), ResourceError> {
    let dest = self.local.parent().unwrap_or_else(|| Path::new("."));
    let files = archive::unpack(&self.local, dest, self.has(Attr::Clean))?;
    debug!(resource = %self.path, files, "unpacked resource");
    Ok(())
  }

  /// Removes the local file, any staged download and the marker.
  pub fn erase(&self) {
    for path in [&self.local_new, &self.local, &self.marker] {
      if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
      {
        warn!(path = %path.display(), error = %e, "failed to remove");
      }
    }
  }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ResourceError> {
  use std::os::unix::fs::PermissionsExt;

  let err = |source| ResourceError::Permissions {
    path: path.to_path_buf(),
    source,
  };
  let mut perms = fs::metadata(path).map_err(err)?.permissions();
  perms.set_mode(perms.mode() | 0o111);
  fs::set_permissions(path, perms).map_err(err)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ResourceError> {
  Ok(())
}

impl PartialEq for Resource {
  fn eq(&self, other: &Self) -> bool {
    self.local == other.local
  }
}

impl Eq for Resource {}

impl PartialOrd for Resource {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Resource {
  fn cmp(&self, other: &Self) -> Ordering {
    self.local.cmp(&other.local)
  }
}

impl Hash for Resource {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.local.hash(state);
  }
}
