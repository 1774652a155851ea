use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::buffer::BufferData;
use crate::codec::delete::encode_delta_log;
use crate::codec::insert::{encode_insert_binlog, BinlogDescriptor};
use crate::codec::stats::encode_stats_log;
use crate::constants::{DELTA_LOG_PREFIX, INSERT_LOG_PREFIX, STATS_LOG_PREFIX};
use crate::errors::{Contextable, NodeError, NodeResult};
use crate::external::allocator::IdAllocator;
use crate::external::object_store::ObjectStore;
use crate::msg::{DelDataBuf, DeltaLogInfo, FlushPack};
use crate::replica::Replica;
use crate::types::{SegmentId, StreamPosition};

// shared by every per-segment flush worker
struct FlushEnv {
  channel: String,
  replica: Arc<Replica>,
  store: Arc<dyn ObjectStore>,
  allocator: Arc<dyn IdAllocator>,
  notify_tx: mpsc::Sender<FlushPack>,
  io_retry_max_seconds: u64,
}

enum WorkItem {
  Insert {
    buffer: BufferData,
    flushed: bool,
    pos: StreamPosition,
  },
  Delete {
    buf: DelDataBuf,
    pos: StreamPosition,
  },
  // injection barrier; admits nothing past it until the injector reports
  Gate {
    injection: Arc<InjectionState>,
  },
}

struct InjectionState {
  target_segment_id: SegmentId,
  remaining: Mutex<usize>,
  injected_tx: Mutex<Option<oneshot::Sender<()>>>,
  done_rx: watch::Receiver<Option<bool>>,
}

impl InjectionState {
  async fn arrive(&self) {
    let mut remaining = self.remaining.lock().await;
    if *remaining == 0 {
      return;
    }
    *remaining -= 1;
    if *remaining == 0 {
      if let Some(tx) = self.injected_tx.lock().await.take() {
        let _ = tx.send(());
      }
    }
  }

  async fn wait_done(&self) -> bool {
    let mut rx = self.done_rx.clone();
    loop {
      if let Some(success) = *rx.borrow() {
        return success;
      }
      if rx.changed().await.is_err() {
        // injector vanished without reporting; treat as failure so normal
        // flushing resumes un-rewritten
        return false;
      }
    }
  }
}

// held by a compaction task; dropping it without inject_done releases every
// gate with success = false
pub struct InjectionHandle {
  injected_rx: Option<oneshot::Receiver<()>>,
  done_tx: watch::Sender<Option<bool>>,
  done_sent: bool,
}

impl InjectionHandle {
  // resolves once every source segment's queue has drained its pre-barrier
  // items
  pub async fn injected(&mut self) -> NodeResult<()> {
    match self.injected_rx.take() {
      Some(rx) => rx
        .await
        .map_err(|_| NodeError::internal("flush manager dropped the injection barrier")),
      None => Ok(()),
    }
  }

  pub fn inject_done(mut self, success: bool) {
    self.send_done(success);
  }

  fn send_done(&mut self, success: bool) {
    if !self.done_sent {
      self.done_sent = true;
      let _ = self.done_tx.send(Some(success));
    }
  }
}

impl Drop for InjectionHandle {
  fn drop(&mut self) {
    self.send_done(false);
  }
}

// turns buffered insert and delete data into persisted blobs, one FIFO queue
// per segment, and lets a compaction task inject itself so in-flight source
// flushes are re-targeted to the compacted segment
pub struct FlushManager {
  env: Arc<FlushEnv>,
  queues: Mutex<HashMap<SegmentId, mpsc::UnboundedSender<WorkItem>>>,
}

impl FlushManager {
  pub fn new(
    channel: impl Into<String>,
    replica: Arc<Replica>,
    store: Arc<dyn ObjectStore>,
    allocator: Arc<dyn IdAllocator>,
    notify_tx: mpsc::Sender<FlushPack>,
    io_retry_max_seconds: u64,
  ) -> FlushManager {
    FlushManager {
      env: Arc::new(FlushEnv {
        channel: channel.into(),
        replica,
        store,
        allocator,
        notify_tx,
        io_retry_max_seconds,
      }),
      queues: Mutex::new(HashMap::new()),
    }
  }

  async fn queue_for(&self, segment_id: SegmentId) -> mpsc::UnboundedSender<WorkItem> {
    let mut queues = self.queues.lock().await;
    queues
      .entry(segment_id)
      .or_insert_with(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        let env = self.env.clone();
        tokio::spawn(run_segment_worker(env, segment_id, rx));
        tx
      })
      .clone()
  }

  // enqueue one insert flush; items for the same segment run strictly in
  // call order, items for distinct segments run in parallel
  pub async fn flush_buffer_data(
    &self,
    buffer: BufferData,
    segment_id: SegmentId,
    flushed: bool,
    pos: StreamPosition,
  ) -> NodeResult<()> {
    let queue = self.queue_for(segment_id).await;
    queue
      .send(WorkItem::Insert { buffer, flushed, pos })
      .map_err(|_| NodeError::internal(format!(
        "flush worker for segment {} is gone",
        segment_id,
      )))
  }

  pub async fn flush_del_data(
    &self,
    buf: DelDataBuf,
    segment_id: SegmentId,
    pos: StreamPosition,
  ) -> NodeResult<()> {
    let queue = self.queue_for(segment_id).await;
    queue
      .send(WorkItem::Delete { buf, pos })
      .map_err(|_| NodeError::internal(format!(
        "flush worker for segment {} is gone",
        segment_id,
      )))
  }

  // register an injection with every listed source segment's queue; the
  // returned handle resolves `injected()` once all pre-barrier items drained
  pub async fn inject_flush(
    &self,
    target_segment_id: SegmentId,
    segment_ids: &[SegmentId],
  ) -> NodeResult<InjectionHandle> {
    let (injected_tx, injected_rx) = oneshot::channel();
    let (done_tx, done_rx) = watch::channel(None);
    let state = Arc::new(InjectionState {
      target_segment_id,
      remaining: Mutex::new(segment_ids.len()),
      injected_tx: Mutex::new(Some(injected_tx)),
      done_rx,
    });

    if segment_ids.is_empty() {
      if let Some(tx) = state.injected_tx.lock().await.take() {
        let _ = tx.send(());
      }
    }
    for &segment_id in segment_ids {
      let queue = self.queue_for(segment_id).await;
      queue
        .send(WorkItem::Gate { injection: state.clone() })
        .map_err(|_| NodeError::internal(format!(
          "flush worker for segment {} is gone",
          segment_id,
        )))?;
    }
    log::info!(
      "channel {} injected flush barrier over {} segments targeting {}",
      self.env.channel,
      segment_ids.len(),
      target_segment_id,
    );

    Ok(InjectionHandle {
      injected_rx: Some(injected_rx),
      done_tx,
      done_sent: false,
    })
  }

  // drop every queue sender; workers drain what they hold and exit
  pub async fn close(&self) {
    self.queues.lock().await.clear();
  }
}

async fn run_segment_worker(
  env: Arc<FlushEnv>,
  segment_id: SegmentId,
  mut rx: mpsc::UnboundedReceiver<WorkItem>,
) {
  // set once an injection completes successfully; every later pack for this
  // segment reports the compacted target instead
  let mut rewrite: Option<SegmentId> = None;

  while let Some(item) = rx.recv().await {
    match item {
      WorkItem::Insert { buffer, flushed, pos } => {
        let mut pack = serialize_insert_flush(&env, segment_id, buffer, flushed, pos).await;
        if let Some(target) = rewrite {
          pack.segment_id = target;
        }
        if env.notify_tx.send(pack).await.is_err() {
          log::warn!(
            "channel {} flush notification consumer is gone; stopping worker for segment {}",
            env.channel, segment_id,
          );
          return;
        }
      }
      WorkItem::Delete { buf, pos } => {
        let mut pack = serialize_delete_flush(&env, segment_id, buf, pos).await;
        if let Some(target) = rewrite {
          pack.segment_id = target;
        }
        if env.notify_tx.send(pack).await.is_err() {
          log::warn!(
            "channel {} flush notification consumer is gone; stopping worker for segment {}",
            env.channel, segment_id,
          );
          return;
        }
      }
      WorkItem::Gate { injection } => {
        injection.arrive().await;
        let success = injection.wait_done().await;
        if success {
          rewrite = Some(injection.target_segment_id);
          log::info!(
            "channel {} segment {} flushes now rewritten to target segment {}",
            env.channel, segment_id, injection.target_segment_id,
          );
        }
      }
    }
  }
}

async fn upload_with_retry(env: &FlushEnv, path: &str, bytes: Vec<u8>) -> NodeResult<()> {
  crate::utils::retry_io(env.io_retry_max_seconds, || {
    env.store.put(path, bytes.clone())
  })
  .await
  .with_context(|| format!("while uploading {}", path))
}

async fn serialize_insert_flush(
  env: &FlushEnv,
  segment_id: SegmentId,
  buffer: BufferData,
  flushed: bool,
  pos: StreamPosition,
) -> FlushPack {
  let mut pack = FlushPack {
    segment_id,
    collection_id: env.replica.collection_id(),
    pos: Some(pos),
    flushed,
    ..Default::default()
  };
  if let Err(e) = write_insert_blobs(env, segment_id, &buffer, &mut pack).await {
    log::error!(
      "channel {} failed to flush {} buffered rows of segment {}: {}",
      env.channel, buffer.size, segment_id, e,
    );
    pack.err = Some(e.to_string());
  }
  pack
}

async fn write_insert_blobs(
  env: &FlushEnv,
  segment_id: SegmentId,
  buffer: &BufferData,
  pack: &mut FlushPack,
) -> NodeResult<()> {
  let (collection_id, partition_id) = env
    .replica
    .segment_meta(segment_id)
    .await
    .ok_or_else(|| NodeError::does_not_exist("segment", segment_id))?;

  if buffer.size > 0 {
    for (&field_id, data) in &buffer.fields {
      let desc = BinlogDescriptor {
        collection_id,
        partition_id,
        segment_id,
        field_id,
        data_type: data.data_type(),
        row_count: data.len() as u64,
      };
      let bytes = encode_insert_binlog(&desc, data)
        .with_context(|| format!("while encoding binlog for field {}", field_id))?;
      let log_id = env.allocator.alloc_id().await?;
      let path = format!(
        "{}/{}/{}/{}/{}/{}",
        INSERT_LOG_PREFIX, collection_id, partition_id, segment_id, field_id, log_id,
      );
      upload_with_retry(env, &path, bytes).await?;
      pack.insert_logs.insert(field_id, path);
    }
  }

  // the stats blob travels with every insert flush so recovery can rebuild
  // the pk index from blobs alone
  let stats = env.replica.segment_pk_stats(segment_id).await?;
  let stats_bytes = encode_stats_log(&stats)?;
  let log_id = env.allocator.alloc_id().await?;
  let stats_path = format!(
    "{}/{}/{}/{}/{}/{}",
    STATS_LOG_PREFIX, collection_id, partition_id, segment_id, stats.field_id, log_id,
  );
  upload_with_retry(env, &stats_path, stats_bytes).await?;
  pack.stats_logs.insert(stats.field_id, stats_path);
  Ok(())
}

async fn serialize_delete_flush(
  env: &FlushEnv,
  segment_id: SegmentId,
  buf: DelDataBuf,
  pos: StreamPosition,
) -> FlushPack {
  let mut pack = FlushPack {
    segment_id,
    collection_id: env.replica.collection_id(),
    pos: Some(pos),
    flushed: false,
    ..Default::default()
  };
  if let Err(e) = write_delta_blob(env, segment_id, &buf, &mut pack).await {
    log::error!(
      "channel {} failed to flush {} staged deletes of segment {}: {}",
      env.channel,
      buf.entries(),
      segment_id,
      e,
    );
    pack.err = Some(e.to_string());
  }
  pack
}

async fn write_delta_blob(
  env: &FlushEnv,
  segment_id: SegmentId,
  buf: &DelDataBuf,
  pack: &mut FlushPack,
) -> NodeResult<()> {
  let (collection_id, partition_id) = env
    .replica
    .segment_meta(segment_id)
    .await
    .unwrap_or((env.replica.collection_id(), 0));

  let bytes = encode_delta_log(&buf.data)?;
  let size = bytes.len() as u64;
  let log_id = env.allocator.alloc_id().await?;
  let path = format!(
    "{}/{}/{}/{}/{}",
    DELTA_LOG_PREFIX, collection_id, partition_id, segment_id, log_id,
  );
  upload_with_retry(env, &path, bytes).await?;
  pack.delta_logs.push(DeltaLogInfo {
    path,
    size,
    ts_from: buf.ts_from,
    ts_to: buf.ts_to,
    entries: buf.entries() as u64,
  });
  Ok(())
}
