use std::future::Future;
use std::time::Duration;

use crate::errors::{NodeError, NodeResult};

// bounded exponential-backoff retry for transient io; anything else returns
// immediately, and an exhausted window is promoted to FatalIo
pub async fn retry_io<T, Fut, F>(max_seconds: u64, mut op: F) -> NodeResult<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = NodeResult<T>>,
{
  let policy = backoff::ExponentialBackoff {
    initial_interval: Duration::from_millis(50),
    max_interval: Duration::from_secs(2),
    max_elapsed_time: Some(Duration::from_secs(max_seconds)),
    ..Default::default()
  };
  let res = backoff::future::retry(policy, || {
    let fut = op();
    async move {
      fut.await.map_err(|e| {
        if e.is_retryable() {
          backoff::Error::transient(e)
        } else {
          backoff::Error::permanent(e)
        }
      })
    }
  })
  .await;
  res.map_err(|e| {
    if e.is_retryable() {
      NodeError::fatal_io(format!("io retries exhausted: {}", e))
    } else {
      e
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn test_transient_errors_retry_then_succeed() {
    let attempts = AtomicUsize::new(0);
    let res = retry_io(5, || {
      let n = attempts.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < 2 {
          Err(NodeError::transient_io("flaky"))
        } else {
          Ok(n)
        }
      }
    })
    .await;
    assert_eq!(res.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_permanent_errors_do_not_retry() {
    let attempts = AtomicUsize::new(0);
    let res: NodeResult<()> = retry_io(5, || {
      attempts.fetch_add(1, Ordering::SeqCst);
      async { Err(NodeError::invalid("bad input")) }
    })
    .await;
    assert!(res.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_exhaustion_promotes_to_fatal() {
    let res: NodeResult<()> = retry_io(0, || async {
      Err(NodeError::transient_io("always down"))
    })
    .await;
    let err = res.unwrap_err();
    assert_eq!(err.kind, crate::errors::NodeErrorKind::FatalIo);
  }
}
