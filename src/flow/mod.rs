pub mod dd_node;
pub mod delete_node;
pub mod insert_node;
pub mod ticker;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::errors::{NodeError, NodeErrorKind, NodeResult};
use crate::external::allocator::IdAllocator;
use crate::external::data_coord::{DataCoordClient, SaveBinlogPathsRequest, SegmentCheckpointInfo};
use crate::external::meta::SchemaService;
use crate::external::msg_stream::{MsgBus, MsgConsumer};
use crate::external::object_store::ObjectStore;
use crate::flow::dd_node::DdNode;
use crate::flow::delete_node::DeleteNode;
use crate::flow::insert_node::InsertBufferNode;
use crate::flow::ticker::MergedTimeTicker;
use crate::flush::FlushManager;
use crate::msg::{FlushPack, FlushRequest};
use crate::opt::Opt;
use crate::replica::{Replica, SegmentCheckpoint};
use crate::types::{CollectionId, SegmentId, Timestamp};
use crate::watch::VchannelInfo;

#[derive(Clone, Debug)]
pub struct FlowGraphConfig {
  pub flush_insert_buffer_size: u64,
  pub flow_graph_queue_len: usize,
  pub sync_interval_millis: u64,
  pub io_retry_max_seconds: u64,
}

impl From<&Opt> for FlowGraphConfig {
  fn from(opts: &Opt) -> Self {
    FlowGraphConfig {
      flush_insert_buffer_size: opts.flush_insert_buffer_size,
      flow_graph_queue_len: opts.flow_graph_queue_len,
      sync_interval_millis: opts.sync_interval_millis,
      io_retry_max_seconds: opts.io_retry_max_seconds,
    }
  }
}

// one virtual channel's pipeline: bus consumer -> DDNode -> insert buffer ->
// delete node -> sink, with side edges into the flush manager and out to the
// coordinator
pub struct FlowGraph {
  channel: String,
  collection_id: CollectionId,
  pub replica: Arc<Replica>,
  pub flush_mgr: Arc<FlushManager>,
  flush_req_tx: mpsc::Sender<FlushRequest>,
  flushing: Arc<Mutex<HashSet<SegmentId>>>,
  shutdown_tx: Arc<watch::Sender<bool>>,
  failed: Arc<AtomicBool>,
  handles: Vec<JoinHandle<()>>,
}

impl FlowGraph {
  pub async fn build(
    vchannel: &VchannelInfo,
    config: FlowGraphConfig,
    filter_threshold: Timestamp,
    schema_service: Arc<dyn SchemaService>,
    store: Arc<dyn ObjectStore>,
    allocator: Arc<dyn IdAllocator>,
    bus: &dyn MsgBus,
    coord: Arc<dyn DataCoordClient>,
  ) -> NodeResult<FlowGraph> {
    let channel = vchannel.channel.clone();
    let collection_id = vchannel.collection_id;

    let replica = Arc::new(Replica::new(
      collection_id,
      channel.clone(),
      schema_service,
      store.clone(),
    ));
    seed_replica(&replica, vchannel).await?;

    let (notify_tx, notify_rx) = mpsc::channel(config.flow_graph_queue_len);
    let flush_mgr = Arc::new(FlushManager::new(
      channel.clone(),
      replica.clone(),
      store,
      allocator,
      notify_tx,
      config.io_retry_max_seconds,
    ));

    let delta_producer = bus.as_producer(&delta_topic(&channel)).await?;
    let dd = DdNode::new(
      vchannel,
      filter_threshold,
      delta_producer,
      config.io_retry_max_seconds,
    );

    let ticker = MergedTimeTicker::new(channel.clone(), config.sync_interval_millis, coord.clone());
    let (flush_req_tx, flush_req_rx) = mpsc::channel(config.flow_graph_queue_len);
    let insert = InsertBufferNode::new(
      channel.clone(),
      replica.clone(),
      flush_mgr.clone(),
      coord.clone(),
      ticker,
      flush_req_rx,
      config.flush_insert_buffer_size,
    );
    let delete = DeleteNode::new(channel.clone(), replica.clone(), flush_mgr.clone());

    let mut consumer = bus.as_consumer(&channel, "siltdb-datanode").await?;
    if let Some(seek) = &vchannel.seek_position {
      consumer.seek(seek).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let failed = Arc::new(AtomicBool::new(false));
    let flushing = Arc::new(Mutex::new(HashSet::new()));

    let driver = tokio::spawn(run_graph(
      channel.clone(),
      consumer,
      dd,
      insert,
      delete,
      shutdown_rx.clone(),
      shutdown_tx.clone(),
      failed.clone(),
    ));
    let notifier = tokio::spawn(run_notification_consumer(
      channel.clone(),
      notify_rx,
      replica.clone(),
      coord,
      flushing.clone(),
      shutdown_rx,
      shutdown_tx.clone(),
      failed.clone(),
      config.io_retry_max_seconds,
    ));

    log::info!(
      "built flow graph for channel {} (collection {}, {} flushed / {} unflushed segments recovered)",
      channel,
      collection_id,
      vchannel.flushed_segments.len(),
      vchannel.unflushed_segments.len(),
    );

    Ok(FlowGraph {
      channel,
      collection_id,
      replica,
      flush_mgr,
      flush_req_tx,
      flushing,
      shutdown_tx,
      failed,
      handles: vec![driver, notifier],
    })
  }

  pub fn channel(&self) -> &str {
    &self.channel
  }

  pub fn collection_id(&self) -> CollectionId {
    self.collection_id
  }

  pub fn is_failed(&self) -> bool {
    self.failed.load(Ordering::SeqCst)
  }

  // duplicate requests for a segment already in flight are idempotent; a
  // request for an unknown segment is an error
  pub async fn flush_segment(&self, segment_id: SegmentId, flushed: bool) -> NodeResult<()> {
    if !self.replica.has_segment(segment_id, false).await {
      if self.replica.has_segment(segment_id, true).await {
        // already flushed; nothing to do
        return Ok(());
      }
      return Err(NodeError::does_not_exist("segment", segment_id));
    }
    {
      let mut flushing = self.flushing.lock().await;
      if !flushing.insert(segment_id) {
        log::info!(
          "channel {} flush of segment {} already in flight",
          self.channel, segment_id,
        );
        return Ok(());
      }
    }
    self.flush_req_tx
      .send(FlushRequest { segment_id, flushed })
      .await
      .map_err(|_| NodeError::internal(format!(
        "channel {} flow graph is gone",
        self.channel,
      )))
  }

  pub async fn close(&mut self) {
    let _ = self.shutdown_tx.send(true);
    self.flush_mgr.close().await;
    for handle in self.handles.drain(..) {
      handle.abort();
    }
    log::info!("closed flow graph for channel {}", self.channel);
  }
}

pub fn delta_topic(channel: &str) -> String {
  format!("{}-delta", channel)
}

async fn seed_replica(replica: &Arc<Replica>, vchannel: &VchannelInfo) -> NodeResult<()> {
  for info in &vchannel.unflushed_segments {
    replica
      .add_normal_segment(
        info.segment_id,
        vchannel.collection_id,
        info.partition_id,
        &vchannel.channel,
        info.num_rows,
        &info.stats_log_paths,
        SegmentCheckpoint {
          num_rows: info.num_rows,
          position: info.dml_position.clone(),
        },
      )
      .await?;
  }
  for info in &vchannel.flushed_segments {
    replica
      .add_flushed_segment(
        info.segment_id,
        vchannel.collection_id,
        info.partition_id,
        &vchannel.channel,
        info.num_rows,
        &info.stats_log_paths,
      )
      .await?;
  }
  Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_graph(
  channel: String,
  mut consumer: Box<dyn MsgConsumer>,
  mut dd: DdNode,
  mut insert: InsertBufferNode,
  mut delete: DeleteNode,
  mut shutdown_rx: watch::Receiver<bool>,
  shutdown_tx: Arc<watch::Sender<bool>>,
  failed: Arc<AtomicBool>,
) {
  loop {
    let pack = tokio::select! {
      _ = shutdown_rx.changed() => {
        if *shutdown_rx.borrow() {
          break;
        }
        continue;
      }
      res = consumer.consume() => match res {
        Ok(Some(pack)) => pack,
        Ok(None) => {
          log::info!("channel {} message stream closed", channel);
          break;
        }
        Err(e) => {
          log::warn!("channel {} consume failed: {}", channel, e);
          continue;
        }
      }
    };

    // the nodes run sequentially on this worker, one tick at a time
    let msg = match dd.operate(pack).await {
      Ok(msg) => msg,
      Err(e) => {
        if is_teardown(&e) {
          log::error!("channel {} DD node failed terminally: {}", channel, e);
          failed.store(true, Ordering::SeqCst);
          let _ = shutdown_tx.send(true);
          break;
        }
        log::warn!("channel {} DD node tick failed: {}", channel, e);
        continue;
      }
    };
    let dropping = msg.drop_collection;
    let msg = match insert.operate(msg).await {
      Ok(msg) => msg,
      Err(e) => {
        log::warn!("channel {} insert buffer tick failed: {}", channel, e);
        continue;
      }
    };
    if let Err(e) = delete.operate(msg).await {
      log::warn!("channel {} delete node tick failed: {}", channel, e);
    }

    if dropping {
      // collection is gone; drain and close the subscription
      log::info!("channel {} draining after DropCollection", channel);
      let _ = shutdown_tx.send(true);
      break;
    }
  }
  insert.close();
}

fn is_teardown(e: &NodeError) -> bool {
  matches!(e.kind, NodeErrorKind::FatalIo | NodeErrorKind::Assertion)
}

#[allow(clippy::too_many_arguments)]
async fn run_notification_consumer(
  channel: String,
  mut notify_rx: mpsc::Receiver<FlushPack>,
  replica: Arc<Replica>,
  coord: Arc<dyn DataCoordClient>,
  flushing: Arc<Mutex<HashSet<SegmentId>>>,
  mut shutdown_rx: watch::Receiver<bool>,
  shutdown_tx: Arc<watch::Sender<bool>>,
  failed: Arc<AtomicBool>,
  io_retry_max_seconds: u64,
) {
  loop {
    let pack = tokio::select! {
      _ = shutdown_rx.changed() => {
        if *shutdown_rx.borrow() {
          break;
        }
        continue;
      }
      maybe_pack = notify_rx.recv() => match maybe_pack {
        Some(pack) => pack,
        None => break,
      }
    };

    flushing.lock().await.remove(&pack.segment_id);

    if let Some(err) = &pack.err {
      log::error!(
        "channel {} flush of segment {} failed terminally ({}); tearing down graph",
        channel, pack.segment_id, err,
      );
      failed.store(true, Ordering::SeqCst);
      let _ = shutdown_tx.send(true);
      break;
    }

    let start_positions = replica
      .list_new_segments_start_positions()
      .await
      .into_iter()
      .map(|(segment_id, position)| SegmentCheckpointInfo {
        segment_id,
        num_rows: 0,
        position,
      })
      .collect();
    let checkpoints = replica
      .list_segments_checkpoints()
      .await
      .into_iter()
      .map(|(segment_id, cp)| SegmentCheckpointInfo {
        segment_id,
        num_rows: cp.num_rows,
        position: cp.position,
      })
      .collect();
    let req = SaveBinlogPathsRequest {
      segment_id: pack.segment_id,
      collection_id: pack.collection_id,
      insert_logs: pack.insert_logs,
      stats_logs: pack.stats_logs,
      delta_logs: pack.delta_logs,
      checkpoints,
      start_positions,
      flushed: pack.flushed,
    };

    let segment_id = req.segment_id;
    let res = crate::utils::retry_io(io_retry_max_seconds, || {
      coord.save_binlog_paths(req.clone())
    })
    .await;
    match res {
      Ok(()) => {
        log::info!(
          "channel {} reported binlog paths for segment {}",
          channel, segment_id,
        );
      }
      Err(e) => {
        // a checkpoint that never reaches the coordinator is unrecoverable
        // from this side; the watch loop restarts the channel
        log::error!(
          "channel {} failed to report binlog paths for segment {}: {}; tearing down graph",
          channel, segment_id, e,
        );
        failed.store(true, Ordering::SeqCst);
        let _ = shutdown_tx.send(true);
        break;
      }
    }
  }
}
