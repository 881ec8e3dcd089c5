//! Garbage collection of the code cache.
//!
//! Entries whose `.lastAccessed` marker is older than the retention period are removed, as is
//! either half of an entry found without the other. Directories left empty go too.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use std::{fs, io};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::is_archive;
use crate::cache::last_accessed_file;
use crate::consts::{LAST_ACCESSED_SUFFIX, NATIVE_CACHE_DIR};

#[derive(Debug, Error)]
pub enum GcError {
  #[error("failed to read cache directory {path}: {source}")]
  ReadCache {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Default, serde::Serialize)]
pub struct GcStats {
  pub files_scanned: usize,
  pub files_deleted: usize,
  pub bundles_deleted: usize,
  pub dirs_removed: usize,
  pub bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.files_deleted + self.bundles_deleted
  }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

fn is_stale(marker: &Path, retention: Duration) -> bool {
  fs::metadata(marker)
    .and_then(|m| m.modified())
    .map(|modified| {
      SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age > retention)
    })
    .unwrap_or(true)
}

/// Splits a cache path into its payload and marker halves.
fn entry_pair(path: &Path) -> (PathBuf, PathBuf) {
  let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
  match name.strip_suffix(LAST_ACCESSED_SUFFIX) {
    Some(payload) => (path.with_file_name(payload), path.to_path_buf()),
    None => (path.to_path_buf(), last_accessed_file(path)),
  }
}

struct Sweep {
  dry_run: bool,
  result: GcResult,
  deleted: HashSet<PathBuf>,
}

impl Sweep {
  fn new(dry_run: bool) -> Self {
    Self {
      dry_run,
      result: GcResult::default(),
      deleted: HashSet::new(),
    }
  }

  fn is_gone(&self, path: &Path) -> bool {
    self.deleted.contains(path) || !path.exists()
  }

  fn delete_file(&mut self, path: &Path) {
    if self.is_gone(path) {
      return;
    }
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if !self.dry_run
      && let Err(e) = fs::remove_file(path)
    {
      warn!(path = %path.display(), error = %e, "failed to delete cached file");
      return;
    }
    debug!(path = %path.display(), "deleted cached file");
    self.result.stats.files_deleted += 1;
    self.result.stats.bytes_freed += size;
    self.deleted.insert(path.to_path_buf());
    self.result.deleted_paths.push(path.to_path_buf());
  }

  fn delete_bundle(&mut self, dir: &Path) {
    let size = dir_size(dir);
    if !self.dry_run
      && let Err(e) = fs::remove_dir_all(dir)
    {
      warn!(path = %dir.display(), error = %e, "failed to delete native bundle");
      return;
    }
    debug!(path = %dir.display(), "deleted native bundle");
    self.result.stats.bundles_deleted += 1;
    self.result.stats.bytes_freed += size;
    self.deleted.insert(dir.to_path_buf());
    self.result.deleted_paths.push(dir.to_path_buf());
  }

  /// Removes `dir` if nothing in it survives the sweep.
  fn remove_if_empty(&mut self, dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
      return;
    };
    let mut entries = entries.flatten();
    if entries.any(|entry| !self.deleted.contains(&entry.path())) {
      return;
    }
    if !self.dry_run
      && let Err(e) = fs::remove_dir(dir)
    {
      warn!(path = %dir.display(), error = %e, "failed to remove empty directory");
      return;
    }
    self.result.stats.dirs_removed += 1;
    self.deleted.insert(dir.to_path_buf());
  }
}

/// Sweeps the code cache at `root`, leaving the native bundle directory to
/// [`collect_native`].
///
/// # Errors
///
/// Returns an error if `root` exists but cannot be read.
pub fn collect(root: &Path, retention: Duration, dry_run: bool) -> Result<GcResult, GcError> {
  let mut sweep = Sweep::new(dry_run);
  if !root.exists() {
    return Ok(sweep.result);
  }
  let native = root.join(NATIVE_CACHE_DIR);

  let walker = WalkDir::new(root)
    .contents_first(true)
    .into_iter()
    .filter_entry(|e| e.path() != native.as_path());

  for entry in walker {
    let entry = match entry {
      Ok(entry) => entry,
      Err(e) if e.depth() == 0 => {
        return Err(GcError::ReadCache {
          path: root.to_path_buf(),
          source: e.into_io_error().unwrap_or_else(|| io::Error::other("walk failed")),
        });
      }
      Err(e) => {
        warn!(error = %e, "skipping unreadable cache entry");
        continue;
      }
    };
    let path = entry.path();

    if entry.file_type().is_dir() {
      sweep.remove_if_empty(path);
      continue;
    }
    if sweep.is_gone(path) {
      continue;
    }

    sweep.result.stats.files_scanned += 1;
    let (payload, marker) = entry_pair(path);
    let has_payload = !sweep.is_gone(&payload);
    let has_marker = !sweep.is_gone(&marker);

    if !has_payload || !has_marker {
      sweep.delete_file(path);
    } else if is_stale(&marker, retention) {
      sweep.delete_file(&marker);
      sweep.delete_file(&payload);
    }
  }

  info!(
    root = %root.display(),
    deleted = sweep.result.stats.files_deleted,
    bytes_freed = sweep.result.stats.bytes_freed,
    dry_run,
    "code cache collected"
  );
  Ok(sweep.result)
}

/// Sweeps the native bundle directory at `root`. A bundle whose archive or marker is missing,
/// or whose marker is stale, is removed as a whole.
///
/// # Errors
///
/// Returns an error if `root` exists but cannot be read.
pub fn collect_native(root: &Path, retention: Duration, dry_run: bool) -> Result<GcResult, GcError> {
  let mut sweep = Sweep::new(dry_run);
  if !root.exists() {
    return Ok(sweep.result);
  }
  let entries = fs::read_dir(root).map_err(|source| GcError::ReadCache {
    path: root.to_path_buf(),
    source,
  })?;

  for entry in entries.flatten() {
    let dir = entry.path();
    if !dir.is_dir() {
      continue;
    }
    sweep.result.stats.files_scanned += 1;

    let archives: Vec<PathBuf> = fs::read_dir(&dir)
      .map(|list| list.flatten().map(|e| e.path()).filter(|p| is_archive(p)).collect())
      .unwrap_or_default();

    let keep = !archives.is_empty()
      && archives.iter().all(|archive| {
        let marker = last_accessed_file(archive);
        marker.exists() && !is_stale(&marker, retention)
      });
    if !keep {
      sweep.delete_bundle(&dir);
    }
  }

  info!(
    root = %root.display(),
    deleted = sweep.result.stats.bundles_deleted,
    bytes_freed = sweep.result.stats.bytes_freed,
    dry_run,
    "native cache collected"
  );
  Ok(sweep.result)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const DAY: Duration = Duration::from_secs(24 * 60 * 60);

  fn age(path: &Path, by: Duration) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - by).unwrap();
  }

  fn entry(root: &Path, payload: bool, marker: bool) -> (PathBuf, PathBuf) {
    let dir = root.join("ab");
    fs::create_dir_all(&dir).unwrap();
    let cached = dir.join("abcdef.jar");
    let last = last_accessed_file(&cached);
    if payload {
      fs::write(&cached, "jar").unwrap();
    }
    if marker {
      fs::write(&last, "").unwrap();
    }
    (cached, last)
  }

  #[test]
  fn lone_payload_is_deleted() {
    let temp = TempDir::new().unwrap();
    let (cached, _) = entry(temp.path(), true, false);
    collect(temp.path(), DAY, false).unwrap();
    assert!(!cached.exists());
  }

  #[test]
  fn lone_marker_is_deleted() {
    let temp = TempDir::new().unwrap();
    let (_, marker) = entry(temp.path(), false, true);
    collect(temp.path(), DAY, false).unwrap();
    assert!(!marker.exists());
  }

  #[test]
  fn fresh_entry_is_kept() {
    let temp = TempDir::new().unwrap();
    let (cached, marker) = entry(temp.path(), true, true);
    let result = collect(temp.path(), DAY, false).unwrap();
    assert!(cached.exists());
    assert!(marker.exists());
    assert_eq!(result.stats.files_deleted, 0);
  }

  #[test]
  fn stale_entry_and_empty_parent_are_deleted() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join(".cache");
    let (cached, marker) = entry(&root, true, true);
    age(&marker, 2 * DAY);

    let result = collect(&root, DAY, false).unwrap();
    assert!(!cached.exists());
    assert!(!marker.exists());
    assert!(!root.join("ab").exists());
    assert_eq!(result.stats.files_deleted, 2);
    assert_eq!(result.stats.bytes_freed, 3);
  }

  #[test]
  fn dry_run_deletes_nothing() {
    let temp = TempDir::new().unwrap();
    let (cached, marker) = entry(temp.path(), true, true);
    age(&marker, 2 * DAY);

    let result = collect(temp.path(), DAY, true).unwrap();
    assert!(cached.exists());
    assert_eq!(result.stats.files_deleted, 2);
    assert_eq!(result.deleted_paths.len(), 2);
  }

  #[test]
  fn native_bundles_are_left_to_native_sweep() {
    let temp = TempDir::new().unwrap();
    let bundle = temp.path().join(NATIVE_CACHE_DIR).join("0123");
    fs::create_dir_all(&bundle).unwrap();
    fs::write(bundle.join("libfoo.so"), "so").unwrap();

    collect(temp.path(), DAY, false).unwrap();
    assert!(bundle.join("libfoo.so").exists());
  }

  #[test]
  fn native_sweep_removes_stale_and_broken_bundles() {
    let temp = TempDir::new().unwrap();
    let make = |name: &str, marker_age: Option<Duration>| {
      let dir = temp.path().join(name);
      fs::create_dir_all(&dir).unwrap();
      let archive = dir.join("natives.zip");
      fs::write(&archive, "zip").unwrap();
      fs::write(dir.join("libfoo.so"), "so").unwrap();
      if let Some(by) = marker_age {
        let marker = last_accessed_file(&archive);
        fs::write(&marker, "").unwrap();
        age(&marker, by);
      }
      dir
    };
    let fresh = make("fresh", Some(Duration::ZERO));
    let stale = make("stale", Some(2 * DAY));
    let unmarked = make("unmarked", None);

    let result = collect_native(temp.path(), DAY, false).unwrap();
    assert!(fresh.exists());
    assert!(!stale.exists());
    assert!(!unmarked.exists());
    assert_eq!(result.stats.bundles_deleted, 2);
  }
}
