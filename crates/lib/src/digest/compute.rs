//! Per-file digest computation.
//!
//! Two algorithm versions coexist so that installs written by older tooling stay verifiable:
//!
//! - **v1** hashes with SHA-1. Archives are hashed entry by entry in case-insensitive name
//!   order, feeding each entry's name and decompressed contents.
//! - **v2** hashes with SHA-256. Archives are reduced to a canonical listing of
//!   `name, size, crc32` per entry in name order, so repackaging the same contents with a
//!   different entry order or compression level yields the same digest.
//!
//! Archives that cannot be read as zips (corrupt, encrypted, truncated) are hashed as raw bytes.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::archive::is_archive;
use crate::progress::ProgressObserver;

const BUFFER_SIZE: usize = 8192;

/// A digest algorithm version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DigestVersion {
  V1,
  V2,
}

impl DigestVersion {
  pub const ALL: [DigestVersion; 2] = [DigestVersion::V1, DigestVersion::V2];

  pub fn number(self) -> u32 {
    match self {
      DigestVersion::V1 => 1,
      DigestVersion::V2 => 2,
    }
  }

  /// Name of the digest file written with this version: `digest.txt`, `digest2.txt`.
  pub fn file_name(self) -> &'static str {
    match self {
      DigestVersion::V1 => "digest.txt",
      DigestVersion::V2 => "digest2.txt",
    }
  }
}

impl fmt::Display for DigestVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "v{}", self.number())
  }
}

/// Computes the digest of the file at `path`.
///
/// # Errors
///
/// Returns an error only if the file itself cannot be read.
pub fn compute_digest(version: DigestVersion, path: &Path, progress: &dyn ProgressObserver) -> io::Result<String> {
  match version {
    DigestVersion::V1 => file_digest::<Sha1>(version, path, progress),
    DigestVersion::V2 => file_digest::<Sha256>(version, path, progress),
  }
}

/// Hashes `data` with the algorithm of `version`.
pub fn hash_bytes(version: DigestVersion, data: &[u8]) -> String {
  match version {
    DigestVersion::V1 => hex::encode(Sha1::digest(data)),
    DigestVersion::V2 => hex::encode(Sha256::digest(data)),
  }
}

fn file_digest<D: sha2::Digest>(version: DigestVersion, path: &Path, progress: &dyn ProgressObserver) -> io::Result<String> {
  if is_archive(path) {
    match archive_digest::<D>(version, path, progress) {
      Ok(hash) => return Ok(hash),
      Err(e) => debug!(path = %path.display(), error = %e, "hashing unreadable archive as raw bytes"),
    }
  }
  raw_digest::<D>(path, progress)
}

fn raw_digest<D: sha2::Digest>(path: &Path, progress: &dyn ProgressObserver) -> io::Result<String> {
  let mut file = File::open(path)?;
  let total = file.metadata()?.len();
  let mut hasher = D::new();
  let mut buffer = [0u8; BUFFER_SIZE];
  let mut read = 0u64;
  let mut last_percent = None;

  loop {
    let n = file.read(&mut buffer)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
    read += n as u64;
    report(progress, &mut last_percent, read, total);
  }

  progress.progress(100);
  Ok(hex::encode(hasher.finalize()))
}

fn archive_digest<D: sha2::Digest>(
  version: DigestVersion,
  path: &Path,
  progress: &dyn ProgressObserver,
) -> Result<String, ZipError> {
  let mut zip = ZipArchive::new(File::open(path)?)?;
  let total = zip.len() as u64;
  let mut hasher = D::new();
  let mut last_percent = None;

  match version {
    DigestVersion::V2 => {
      let mut entries = Vec::with_capacity(zip.len());
      for index in 0..zip.len() {
        let entry = zip.by_index_raw(index)?;
        entries.push((entry.name().to_string(), entry.size(), entry.crc32()));
      }
      entries.sort_by(|a, b| a.0.cmp(&b.0));
      for (done, (name, size, crc)) in entries.iter().enumerate() {
        hasher.update(name.as_bytes());
        hasher.update(size.to_be_bytes());
        hasher.update(crc.to_be_bytes());
        report(progress, &mut last_percent, done as u64 + 1, total);
      }
    }
    DigestVersion::V1 => {
      let mut order = Vec::with_capacity(zip.len());
      for index in 0..zip.len() {
        order.push((zip.by_index_raw(index)?.name().to_string(), index));
      }
      order.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()).then_with(|| a.0.cmp(&b.0)));

      let mut buffer = [0u8; BUFFER_SIZE];
      for (done, (name, index)) in order.iter().enumerate() {
        hasher.update(name.as_bytes());
        let mut entry = zip.by_index(*index)?;
        loop {
          let n = entry.read(&mut buffer)?;
          if n == 0 {
            break;
          }
          hasher.update(&buffer[..n]);
        }
        report(progress, &mut last_percent, done as u64 + 1, total);
      }
    }
  }

  progress.progress(100);
  Ok(hex::encode(hasher.finalize()))
}

fn report(progress: &dyn ProgressObserver, last: &mut Option<u32>, done: u64, total: u64) {
  if total == 0 {
    return;
  }
  let percent = (done.saturating_mul(100) / total).min(100) as u32;
  if *last != Some(percent) {
    *last = Some(percent);
    progress.progress(percent);
  }
}
