//! Implementation of the `updraft digest` command.
//!
//! Hashes every resource the manifest in an application directory names and writes the digest
//! files a server publishes next to them, signing them when given a key.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use updraft_lib::app::Application;
use updraft_lib::digest::create_digests;
use updraft_lib::env::{EnvConfig, thread_pool_size};
use updraft_lib::net::HttpConnector;
use updraft_lib::signature::{encode_verifying_key, load_signing_key};

use crate::output::{OutputFormat, print_json, print_stat, print_success, print_warning};

#[derive(serde::Serialize)]
struct DigestOutput {
  resources: usize,
  written: Vec<std::path::PathBuf>,
  public_key: Option<String>,
}

/// Execute the digest command.
///
/// # Errors
///
/// Returns an error if the manifest cannot be read, the key cannot be loaded, or a resource
/// cannot be hashed.
pub fn cmd_digest(app_dir: &Path, key: Option<&Path>, output: OutputFormat) -> Result<()> {
  let signing_key = key
    .map(|path| load_signing_key(path).with_context(|| format!("Failed to load signing key {}", path.display())))
    .transpose()?;

  let mut app = Application::new(EnvConfig::new(app_dir), Arc::new(HttpConnector::new()));
  app.init().context("Failed to read manifest")?;
  let resources = app.all_resources().context("Failed to list resources")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let written = rt
    .block_on(create_digests(app_dir, &resources, signing_key.as_ref(), thread_pool_size()))
    .context("Failed to create digests")?;

  let result = DigestOutput {
    resources: resources.len(),
    written,
    public_key: signing_key.map(|key| encode_verifying_key(&key.verifying_key())),
  };

  if output.is_json() {
    print_json(&result)?;
  } else {
    print_success("Digests written!");
    print_stat("Resources", &result.resources.to_string());
    for path in &result.written {
      print_stat("Wrote", &path.display().to_string());
    }
    match &result.public_key {
      Some(public_key) => print_stat("Public key", public_key),
      None => print_warning("Digests are unsigned; clients with certificates will reject them"),
    }
  }

  Ok(())
}
