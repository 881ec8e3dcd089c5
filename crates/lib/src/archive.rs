//! Zip archive helpers shared by resource unpacking, native bundles and patches.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;
use zip::result::ZipError;

#[derive(Debug, Error)]
pub enum ArchiveError {
  #[error("failed to open archive {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid archive {path}: {source}")]
  Zip {
    path: PathBuf,
    #[source]
    source: ZipError,
  },

  #[error("failed to extract {entry} from {path}: {source}")]
  Extract {
    path: PathBuf,
    entry: String,
    #[source]
    source: io::Error,
  },
}

/// Whether `path` names a zip based archive (`.jar` or `.zip`).
pub fn is_archive(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| ext.eq_ignore_ascii_case("jar") || ext.eq_ignore_ascii_case("zip"))
}

/// Extracts `archive` into `dest`, returning the number of files written.
///
/// With `clean`, every top-level directory named by an entry is removed from `dest` first so
/// files dropped from the archive do not survive. Entries whose names would escape `dest` are
/// skipped.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or an entry cannot be written.
pub fn unpack(archive: &Path, dest: &Path, clean: bool) -> Result<usize, ArchiveError> {
  let file = File::open(archive).map_err(|source| ArchiveError::Open {
    path: archive.to_path_buf(),
    source,
  })?;
  let mut zip = ZipArchive::new(file).map_err(|source| ArchiveError::Zip {
    path: archive.to_path_buf(),
    source,
  })?;

  if clean {
    clean_top_level_dirs(&zip, dest);
  }

  let mut written = 0;
  for index in 0..zip.len() {
    let mut entry = zip.by_index(index).map_err(|source| ArchiveError::Zip {
      path: archive.to_path_buf(),
      source,
    })?;
    let name = entry.name().to_string();
    let Some(relative) = entry.enclosed_name() else {
      warn!(archive = %archive.display(), entry = %name, "skipping entry outside of destination");
      continue;
    };
    let target = dest.join(relative);
    let extract_err = |source| ArchiveError::Extract {
      path: archive.to_path_buf(),
      entry: name.clone(),
      source,
    };

    if entry.is_dir() {
      fs::create_dir_all(&target).map_err(extract_err)?;
      continue;
    }
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).map_err(extract_err)?;
    }
    let mut out = File::create(&target).map_err(extract_err)?;
    io::copy(&mut entry, &mut out).map_err(extract_err)?;

    #[cfg(unix)]
    if let Some(mode) = entry.unix_mode() {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777)).map_err(extract_err)?;
    }

    written += 1;
  }

  debug!(archive = %archive.display(), dest = %dest.display(), files = written, "unpacked archive");
  Ok(written)
}

fn clean_top_level_dirs(zip: &ZipArchive<File>, dest: &Path) {
  let mut dirs = BTreeSet::new();
  for name in zip.file_names() {
    let path = Path::new(name);
    let mut components = path.components();
    if let (Some(Component::Normal(first)), Some(_)) = (components.next(), components.next()) {
      dirs.insert(first.to_os_string());
    }
  }
  for dir in dirs {
    let path = dest.join(dir);
    if path.is_dir() {
      debug!(path = %path.display(), "cleaning directory before unpack");
      if let Err(e) = fs::remove_dir_all(&path) {
        warn!(path = %path.display(), error = %e, "failed to clean directory");
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod testutil {
  use std::fs::File;
  use std::io::Write;
  use std::path::Path;

  use zip::write::SimpleFileOptions;
  use zip::{CompressionMethod, ZipWriter};

  /// Writes a zip at `path` holding `entries` in the given order.
  pub fn write_zip(path: &Path, entries: &[(&str, &str)], method: CompressionMethod) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default().compression_method(method);
    for (name, data) in entries {
      zip.start_file(*name, options).unwrap();
      zip.write_all(data.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
  }
}
