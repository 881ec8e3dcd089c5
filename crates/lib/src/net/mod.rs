//! Network access.
//!
//! The updater only ever needs two operations, [`Connector::fetch`] for small documents and
//! [`Connector::download`] for files, so tests substitute an in-process connector while the CLI
//! uses [`HttpConnector`].

mod download;

#[cfg(test)]
pub(crate) mod testutil;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub use download::{DownloadReport, download_resources};

#[derive(Debug, Error)]
pub enum NetError {
  #[error("request to {url} failed: {message}")]
  Request { url: String, message: String },

  #[error("{url} returned HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl NetError {
  /// Whether the server reported that the file does not exist.
  pub fn is_not_found(&self) -> bool {
    matches!(self, NetError::Status { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
  }
}

#[async_trait]
pub trait Connector: Send + Sync {
  /// Fetches the body of `url` into memory.
  async fn fetch(&self, url: &Url) -> Result<Vec<u8>, NetError>;

  /// Downloads `url` into `dest`, creating parent directories and replacing any existing file.
  /// Returns the number of bytes written.
  async fn download(&self, url: &Url, dest: &Path) -> Result<u64, NetError>;
}

/// A [`Connector`] backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
  client: reqwest::Client,
}

impl HttpConnector {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }

  async fn get(&self, url: &Url) -> Result<reqwest::Response, NetError> {
    let response = self.client.get(url.clone()).send().await.map_err(|e| NetError::Request {
      url: url.to_string(),
      message: e.to_string(),
    })?;

    if !response.status().is_success() {
      return Err(NetError::Status {
        url: url.to_string(),
        status: response.status().as_u16(),
      });
    }
    Ok(response)
  }
}

#[async_trait]
impl Connector for HttpConnector {
  async fn fetch(&self, url: &Url) -> Result<Vec<u8>, NetError> {
    debug!(url = %url, "fetching");
    let response = self.get(url).await?;
    let bytes = response.bytes().await.map_err(|e| NetError::Request {
      url: url.to_string(),
      message: e.to_string(),
    })?;
    Ok(bytes.to_vec())
  }

  async fn download(&self, url: &Url, dest: &Path) -> Result<u64, NetError> {
    info!(url = %url, dest = %dest.display(), "downloading");
    let mut response = self.get(url).await?;

    let write_err = |source| NetError::Write {
      path: dest.to_path_buf(),
      source,
    };
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let mut file = fs::File::create(dest).await.map_err(write_err)?;

    let mut written = 0u64;
    loop {
      let chunk = match response.chunk().await {
        Ok(Some(chunk)) => chunk,
        Ok(None) => break,
        Err(e) => {
          drop(file);
          let _ = fs::remove_file(dest).await;
          return Err(NetError::Request {
            url: url.to_string(),
            message: e.to_string(),
          });
        }
      };
      file.write_all(&chunk).await.map_err(write_err)?;
      written += chunk.len() as u64;
    }
    file.flush().await.map_err(write_err)?;

    debug!(url = %url, bytes = written, "download complete");
    Ok(written)
  }
}
