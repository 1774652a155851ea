use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::{NodeError, NodeResult};

// opaque key/value blob store; uploads are idempotent on equal bytes
#[async_trait]
pub trait ObjectStore: Send + Sync {
  async fn put(&self, path: &str, bytes: Vec<u8>) -> NodeResult<()>;

  async fn get(&self, path: &str) -> NodeResult<Vec<u8>>;

  async fn multi_get(&self, paths: &[String]) -> NodeResult<Vec<Vec<u8>>> {
    let mut res = Vec::with_capacity(paths.len());
    for path in paths {
      res.push(self.get(path).await?);
    }
    Ok(res)
  }
}

pub struct MemoryObjectStore {
  blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
  pub fn new() -> Self {
    MemoryObjectStore {
      blobs: RwLock::new(HashMap::new()),
    }
  }

  pub async fn len(&self) -> usize {
    self.blobs.read().await.len()
  }

  pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
    self.blobs
      .read()
      .await
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect()
  }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
  async fn put(&self, path: &str, bytes: Vec<u8>) -> NodeResult<()> {
    self.blobs.write().await.insert(path.to_string(), bytes);
    Ok(())
  }

  async fn get(&self, path: &str) -> NodeResult<Vec<u8>> {
    self.blobs
      .read()
      .await
      .get(path)
      .cloned()
      .ok_or_else(|| NodeError::does_not_exist("blob", path))
  }
}
