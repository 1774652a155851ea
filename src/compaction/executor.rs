use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};

use crate::compaction::task::CompactionTask;
use crate::errors::{NodeError, NodeResult};
use crate::msg::CompactionResult;
use crate::types::{CollectionId, PlanId};

struct RunningTask {
  collection_id: CollectionId,
  cancel_tx: watch::Sender<bool>,
}

// bounded worker pool keyed on plan id; tasks queue on the semaphore and are
// cancellable at every suspension point
pub struct CompactionExecutor {
  semaphore: Arc<Semaphore>,
  running: Arc<Mutex<HashMap<PlanId, RunningTask>>>,
  completed: Arc<Mutex<HashMap<PlanId, CompactionResult>>>,
}

impl CompactionExecutor {
  pub fn new(parallelism: usize) -> CompactionExecutor {
    CompactionExecutor {
      semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
      running: Arc::new(Mutex::new(HashMap::new())),
      completed: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub async fn execute(&self, task: CompactionTask) -> NodeResult<()> {
    let plan_id = task.plan.plan_id;
    let collection_id = task.plan.collection_id;
    let timeout_seconds = task.plan.timeout_seconds.max(1);

    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    {
      let mut running = self.running.lock().await;
      if running.contains_key(&plan_id) {
        return Err(NodeError::invalid(format!(
          "compaction plan {} is already executing",
          plan_id,
        )));
      }
      running.insert(plan_id, RunningTask { collection_id, cancel_tx });
    }

    let semaphore = self.semaphore.clone();
    let running = self.running.clone();
    let completed = self.completed.clone();
    tokio::spawn(async move {
      // the timeout covers queueing as well; a plan is not allowed to sit
      // around past its deadline either
      let work = async {
        let _permit = semaphore
          .acquire_owned()
          .await
          .map_err(|_| NodeError::cancelled("compaction executor shut down"))?;
        task.execute().await
      };
      let outcome = tokio::select! {
        _ = cancelled(&mut cancel_rx) => Err(NodeError::cancelled(format!(
          "compaction plan {} cancelled",
          plan_id,
        ))),
        res = tokio::time::timeout(Duration::from_secs(timeout_seconds), work) => match res {
          Ok(res) => res,
          Err(_) => Err(NodeError::cancelled(format!(
            "compaction plan {} timed out after {}s",
            plan_id, timeout_seconds,
          ))),
        }
      };
      match outcome {
        Ok(result) => {
          log::info!(
            "compaction plan {} produced target segment {} ({} rows)",
            plan_id, result.target_segment_id, result.num_rows,
          );
          completed.lock().await.insert(plan_id, result);
        }
        Err(e) => {
          log::warn!("compaction plan {} aborted: {}", plan_id, e);
        }
      }
      running.lock().await.remove(&plan_id);
    });
    Ok(())
  }

  // cancel all in-flight or queued plans covering the collection; idempotent
  pub async fn stop_by_collection(&self, collection_id: CollectionId) {
    let running = self.running.lock().await;
    for (plan_id, task) in running.iter() {
      if task.collection_id == collection_id {
        log::info!(
          "cancelling compaction plan {} for dropped collection {}",
          plan_id, collection_id,
        );
        let _ = task.cancel_tx.send(true);
      }
    }
  }

  pub async fn running_count(&self) -> usize {
    self.running.lock().await.len()
  }

  pub async fn take_completed(&self, plan_id: PlanId) -> Option<CompactionResult> {
    self.completed.lock().await.remove(&plan_id)
  }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
  loop {
    if *rx.borrow() {
      return;
    }
    if rx.changed().await.is_err() {
      // executor dropped; treat as cancellation
      return;
    }
  }
}
