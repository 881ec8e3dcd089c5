//! In-process connector for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Url;

use super::{Connector, NetError};

/// Serves fixed bodies by URL and, optionally, files under a directory mounted at a base URL.
/// Anything else is a 404. Every request is counted.
#[derive(Default)]
pub struct MapConnector {
  routes: Mutex<HashMap<String, Vec<u8>>>,
  mounts: Vec<(String, PathBuf)>,
  hits: Mutex<HashMap<String, usize>>,
}

impl MapConnector {
  pub fn new<I, K, V>(routes: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: AsRef<[u8]>,
  {
    let routes = routes
      .into_iter()
      .map(|(k, v)| (k.into(), v.as_ref().to_vec()))
      .collect();
    Self {
      routes: Mutex::new(routes),
      ..Self::default()
    }
  }

  /// Serves files below `root` for URLs starting with `base`.
  pub fn serving_dir(base: &str, root: &Path) -> Self {
    Self {
      mounts: vec![(base.to_string(), root.to_path_buf())],
      ..Self::default()
    }
  }

  pub fn insert(&self, url: &str, body: impl AsRef<[u8]>) {
    self.routes.lock().unwrap().insert(url.to_string(), body.as_ref().to_vec());
  }

  pub fn hits(&self, url: &str) -> usize {
    self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
  }

  pub fn total_hits(&self) -> usize {
    self.hits.lock().unwrap().values().sum()
  }

  fn lookup(&self, url: &Url) -> Result<Vec<u8>, NetError> {
    let key = url.to_string();
    *self.hits.lock().unwrap().entry(key.clone()).or_default() += 1;

    if let Some(body) = self.routes.lock().unwrap().get(&key) {
      return Ok(body.clone());
    }
    for (base, root) in &self.mounts {
      if let Some(rest) = key.strip_prefix(base.as_str()) {
        let decoded = rest.replace("%20", " ");
        if let Ok(body) = std::fs::read(root.join(decoded)) {
          return Ok(body);
        }
      }
    }
    Err(NetError::Status { url: key, status: 404 })
  }
}

#[async_trait]
impl Connector for MapConnector {
  async fn fetch(&self, url: &Url) -> Result<Vec<u8>, NetError> {
    self.lookup(url)
  }

  async fn download(&self, url: &Url, dest: &Path) -> Result<u64, NetError> {
    let body = self.lookup(url)?;
    let write_err = |source| NetError::Write {
      path: dest.to_path_buf(),
      source,
    };
    if let Some(parent) = dest.parent() {
      std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(dest, &body).map_err(write_err)?;
    Ok(body.len() as u64)
  }
}
