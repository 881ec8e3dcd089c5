//! Cross-process update lock for an install directory.
//!
//! Only one updater may modify an install directory at a time. The lock is an OS-level
//! exclusive lock (`flock` / `LockFileEx`) on `updating.lock`, which also records who holds it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::LOCK_FILE;

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub app_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("{app_dir} is being updated by another process: {command} (PID {pid}, started {started_at})")]
  Contention {
    command: String,
    pid: u32,
    started_at: String,
    app_dir: PathBuf,
  },

  #[error("{app_dir} is being updated by another process")]
  ContentionUnknown { app_dir: PathBuf },

  #[error("failed to open lock file {path}: {source}")]
  OpenFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

impl LockError {
  /// Whether another process holds the lock, as opposed to the lock being unusable.
  pub fn is_contention(&self) -> bool {
    matches!(self, LockError::Contention { .. } | LockError::ContentionUnknown { .. })
  }
}

/// Held while an update runs; released when dropped.
#[derive(Debug)]
pub struct UpdateLock {
  file: File,
  lock_path: PathBuf,
}

impl UpdateLock {
  /// Takes the lock for `app_dir` without waiting.
  ///
  /// # Errors
  ///
  /// Returns [`LockError::Contention`] (or `ContentionUnknown`) if another process holds it.
  pub fn acquire(app_dir: &Path, command: &str) -> Result<Self, LockError> {
    let lock_path = app_dir.join(LOCK_FILE);

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| LockError::OpenFile {
        path: lock_path.clone(),
        source,
      })?;

    if let Err(err) = try_lock(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(read_contention_error(&lock_path, app_dir));
      }
      return Err(LockError::LockFailed(err));
    }

    write_metadata(&file, command, app_dir)?;
    debug!(path = %lock_path.display(), "acquired update lock");
    Ok(UpdateLock { file, lock_path })
  }

  /// Reads the lock metadata through the held handle; opening the file again would fail on
  /// Windows while it is locked.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  /// Releases the lock.
  pub fn release(self) {
    debug!(path = %self.lock_path.display(), "released update lock");
  }
}

fn write_metadata(file: &File, command: &str, app_dir: &Path) -> Result<(), LockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    app_dir: app_dir.to_path_buf(),
  };

  file.set_len(0).map_err(LockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(LockError::WriteMetadata)?;
  Ok(())
}

fn read_contention_error(lock_path: &Path, app_dir: &Path) -> LockError {
  if let Ok(mut file) = File::open(lock_path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      return LockError::Contention {
        command: metadata.command,
        pid: metadata.pid,
        started_at: format!("Unix timestamp {}", metadata.started_at_unix),
        app_dir: app_dir.to_path_buf(),
      };
    }
  }

  LockError::ContentionUnknown {
    app_dir: app_dir.to_path_buf(),
  }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized, and the
  // handle belongs to an open file.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
  };

  if result == 0 {
    let err = io::Error::last_os_error();
    // ERROR_LOCK_VIOLATION
    if err.raw_os_error() == Some(33) {
      return Err(io::Error::new(io::ErrorKind::WouldBlock, err));
    }
    Err(err)
  } else {
    Ok(())
  }
}
