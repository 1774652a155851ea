use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::TICK_LATENCY_LOG_EVERY;
use crate::external::data_coord::DataCoordClient;
use crate::types::Timestamp;

// merges per-tick timestamps into at most one time-tick message per interval,
// always carrying the most recent timestamp observed
pub struct MergedTimeTicker {
  ts_tx: watch::Sender<Timestamp>,
  ts_rx: watch::Receiver<Timestamp>,
  shutdown_tx: watch::Sender<bool>,
  handle: Option<JoinHandle<()>>,
}

impl MergedTimeTicker {
  pub fn new(
    channel: impl Into<String>,
    interval_millis: u64,
    coord: Arc<dyn DataCoordClient>,
  ) -> MergedTimeTicker {
    let channel = channel.into();
    let (ts_tx, ts_rx) = watch::channel(0u64);
    let task_ts_rx = ts_rx.clone();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(Duration::from_millis(interval_millis.max(1)));
      let mut last_emitted: Timestamp = 0;
      let mut last_emit_at = Instant::now();
      let mut emitted: u64 = 0;
      loop {
        tokio::select! {
          _ = interval.tick() => {}
          _ = shutdown_rx.changed() => {
            if *shutdown_rx.borrow() {
              return;
            }
            continue;
          }
        }
        let current = *task_ts_rx.borrow();
        if current <= last_emitted {
          continue;
        }
        if let Err(e) = coord.report_time_tick(&channel, current).await {
          log::warn!("channel {} failed to report time tick: {}", channel, e);
          continue;
        }
        last_emitted = current;
        emitted += 1;
        if emitted % TICK_LATENCY_LOG_EVERY == 0 {
          log::info!(
            "channel {} emitted {} time ticks; {:?} since previous emission",
            channel,
            emitted,
            last_emit_at.elapsed(),
          );
        }
        last_emit_at = Instant::now();
      }
    });

    MergedTimeTicker {
      ts_tx,
      ts_rx,
      shutdown_tx,
      handle: Some(handle),
    }
  }

  // record the latest observed timestamp; the background sender picks up
  // whatever is newest at its next interval
  pub fn tick(&self, ts: Timestamp) {
    if ts > *self.ts_rx.borrow() {
      let _ = self.ts_tx.send(ts);
    }
  }

  pub fn close(&mut self) {
    let _ = self.shutdown_tx.send(true);
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}

impl Drop for MergedTimeTicker {
  fn drop(&mut self) {
    self.close();
  }
}
