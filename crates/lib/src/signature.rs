//! Detached signatures over control files.
//!
//! Control files (digests and the manifest) may be accompanied by a `<name>.sig` file holding a
//! base64 encoded ed25519 signature. A file is trusted when any key in the [`CertificateSet`]
//! validates its signature, so keys can be rotated without invalidating older signatures.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Column at which generated signatures are wrapped.
const SIGNATURE_LINE_WIDTH: usize = 76;

#[derive(Debug, Error)]
pub enum SignatureError {
  #[error("no trusted certificate validates the signature of {target}")]
  NoValidSignature { target: PathBuf },

  #[error("malformed signature for {target}: {message}")]
  Malformed { target: PathBuf, message: String },

  #[error("invalid key in {path}: {message}")]
  InvalidKey { path: PathBuf, message: String },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Trusted public keys, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct CertificateSet {
  keys: Vec<VerifyingKey>,
}

impl CertificateSet {
  pub fn new(keys: Vec<VerifyingKey>) -> Self {
    Self { keys }
  }

  /// Loads keys from each file in `paths`.
  ///
  /// Every non-empty line that is not a `#` comment must hold a hex encoded 32-byte ed25519
  /// public key.
  ///
  /// # Errors
  ///
  /// Returns an error if a file cannot be read or holds a malformed key.
  pub fn load(paths: &[PathBuf]) -> Result<Self, SignatureError> {
    let mut keys = Vec::new();
    for path in paths {
      let text = fs::read_to_string(path).map_err(|source| SignatureError::Read {
        path: path.clone(),
        source,
      })?;
      for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
          continue;
        }
        keys.push(parse_verifying_key(line).map_err(|message| SignatureError::InvalidKey {
          path: path.clone(),
          message,
        })?);
      }
    }
    debug!(count = keys.len(), "loaded trusted certificates");
    Ok(Self { keys })
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  pub fn len(&self) -> usize {
    self.keys.len()
  }

  fn any_validates(&self, message: &[u8], signature: &Signature) -> bool {
    self.keys.iter().any(|key| key.verify(message, signature).is_ok())
  }
}

fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, String> {
  let bytes = hex::decode(hex_key).map_err(|e| format!("failed to decode hex: {e}"))?;
  let array: [u8; 32] = bytes
    .try_into()
    .map_err(|_| "expected 32-byte ed25519 public key".to_string())?;
  VerifyingKey::from_bytes(&array).map_err(|e| e.to_string())
}

/// Hex encoding of a public key, as read by [`CertificateSet::load`].
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
  hex::encode(key.as_bytes())
}

/// Loads a signing key stored as the hex encoded 32-byte secret seed.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a 32-byte seed.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, SignatureError> {
  let text = fs::read_to_string(path).map_err(|source| SignatureError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  let invalid = |message: String| SignatureError::InvalidKey {
    path: path.to_path_buf(),
    message,
  };
  let bytes = hex::decode(text.trim()).map_err(|e| invalid(format!("failed to decode hex: {e}")))?;
  let seed: [u8; 32] = bytes
    .try_into()
    .map_err(|_| invalid("expected 32-byte ed25519 secret key".to_string()))?;
  Ok(SigningKey::from_bytes(&seed))
}

/// Checks `signature_file` against `target` with every trusted certificate.
///
/// The signature file is removed whatever the outcome. When no certificate validates the
/// signature the target is removed too, so an untrusted control file never lingers on disk.
///
/// # Errors
///
/// Returns [`SignatureError::NoValidSignature`] when no certificate matches, or an error if
/// either file cannot be read or the signature is malformed.
pub fn verify_signature(certs: &CertificateSet, signature_file: &Path, target: &Path) -> Result<(), SignatureError> {
  let result = check_signature(certs, signature_file, target);
  remove_quietly(signature_file);
  if result.is_err() {
    remove_quietly(target);
  }
  result
}

fn check_signature(certs: &CertificateSet, signature_file: &Path, target: &Path) -> Result<(), SignatureError> {
  let encoded = fs::read_to_string(signature_file).map_err(|source| SignatureError::Read {
    path: signature_file.to_path_buf(),
    source,
  })?;
  let signature = decode_signature(&encoded).map_err(|message| SignatureError::Malformed {
    target: target.to_path_buf(),
    message,
  })?;
  let message = fs::read(target).map_err(|source| SignatureError::Read {
    path: target.to_path_buf(),
    source,
  })?;

  if certs.any_validates(&message, &signature) {
    info!(target = %target.display(), "signature verified");
    Ok(())
  } else {
    warn!(target = %target.display(), certs = certs.len(), "no certificate validates signature");
    Err(SignatureError::NoValidSignature {
      target: target.to_path_buf(),
    })
  }
}

fn decode_signature(encoded: &str) -> Result<Signature, String> {
  let joined: String = encoded.split_whitespace().collect();
  let bytes = STANDARD.decode(joined).map_err(|e| e.to_string())?;
  let array: [u8; 64] = bytes
    .try_into()
    .map_err(|_| "expected 64-byte ed25519 signature".to_string())?;
  Ok(Signature::from_bytes(&array))
}

/// Signs `target` and writes the wrapped base64 signature to `signature_file`.
///
/// # Errors
///
/// Returns an error if the target cannot be read or the signature cannot be written.
pub fn sign_file(key: &SigningKey, target: &Path, signature_file: &Path) -> Result<(), SignatureError> {
  let message = fs::read(target).map_err(|source| SignatureError::Read {
    path: target.to_path_buf(),
    source,
  })?;
  let signature = key.sign(&message);
  fs::write(signature_file, encode_signature(&signature)).map_err(|source| SignatureError::Write {
    path: signature_file.to_path_buf(),
    source,
  })
}

fn encode_signature(signature: &Signature) -> String {
  let encoded = STANDARD.encode(signature.to_bytes());
  let mut out = String::with_capacity(encoded.len() + encoded.len() / SIGNATURE_LINE_WIDTH + 1);
  for chunk in encoded.as_bytes().chunks(SIGNATURE_LINE_WIDTH) {
    // base64 output is ASCII, so chunking on bytes never splits a character.
    out.push_str(&String::from_utf8_lossy(chunk));
    out.push('\n');
  }
  out
}

fn remove_quietly(path: &Path) {
  if let Err(e) = fs::remove_file(path)
    && e.kind() != io::ErrorKind::NotFound
  {
    warn!(path = %path.display(), error = %e, "failed to remove file");
  }
}
