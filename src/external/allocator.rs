use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::{NodeError, NodeResult};
use crate::types::{compose_ts, Timestamp};

// strictly increasing id sequence across the process lifetime
#[async_trait]
pub trait IdAllocator: Send + Sync {
  async fn alloc_id(&self) -> NodeResult<i64>;

  // returns [start, end)
  async fn alloc_id_batch(&self, n: i64) -> NodeResult<(i64, i64)>;
}

#[async_trait]
pub trait TsOracle: Send + Sync {
  async fn now(&self) -> NodeResult<Timestamp>;
}

pub struct LocalIdAllocator {
  next: AtomicI64,
}

impl LocalIdAllocator {
  pub fn new(start: i64) -> Self {
    LocalIdAllocator {
      next: AtomicI64::new(start),
    }
  }
}

#[async_trait]
impl IdAllocator for LocalIdAllocator {
  async fn alloc_id(&self) -> NodeResult<i64> {
    Ok(self.next.fetch_add(1, Ordering::SeqCst))
  }

  async fn alloc_id_batch(&self, n: i64) -> NodeResult<(i64, i64)> {
    if n <= 0 {
      return Err(NodeError::invalid("id batch size must be positive"));
    }
    let start = self.next.fetch_add(n, Ordering::SeqCst);
    Ok((start, start + n))
  }
}

// hybrid timestamps off the local clock; the logical counter disambiguates
// reads within one millisecond
pub struct LocalTsOracle {
  logical: AtomicU64,
}

impl LocalTsOracle {
  pub fn new() -> Self {
    LocalTsOracle {
      logical: AtomicU64::new(0),
    }
  }
}

#[async_trait]
impl TsOracle for LocalTsOracle {
  async fn now(&self) -> NodeResult<Timestamp> {
    let physical = Utc::now().timestamp_millis();
    let logical = self.logical.fetch_add(1, Ordering::SeqCst);
    Ok(compose_ts(physical, logical))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_batch_is_contiguous_and_increasing() {
    let alloc = LocalIdAllocator::new(100);
    let a = alloc.alloc_id().await.unwrap();
    let (start, end) = alloc.alloc_id_batch(5).await.unwrap();
    let b = alloc.alloc_id().await.unwrap();
    assert_eq!(a, 100);
    assert_eq!((start, end), (101, 106));
    assert_eq!(b, 106);
  }
}
