use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::compaction::executor::CompactionExecutor;
use crate::compaction::task::CompactionTask;
use crate::errors::{Contextable, NodeError, NodeResult};
use crate::external::allocator::{IdAllocator, TsOracle};
use crate::external::data_coord::DataCoordClient;
use crate::external::meta::SchemaService;
use crate::external::msg_stream::MsgBus;
use crate::external::object_store::ObjectStore;
use crate::flow::{FlowGraph, FlowGraphConfig};
use crate::msg::CompactionPlan;
use crate::opt::Opt;
use crate::types::{CollectionId, SegmentId, Timestamp};
use crate::watch::{ChannelWatchInfo, WatchState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
  Initializing,
  Healthy,
  Stopped,
}

// the data node core: one flow graph per watched channel plus the shared
// compaction executor
pub struct DataNode {
  config: FlowGraphConfig,
  compaction_parallelism: usize,
  entity_ttl_seconds: i64,
  schema_service: Arc<dyn SchemaService>,
  store: Arc<dyn ObjectStore>,
  allocator: Arc<dyn IdAllocator>,
  oracle: Arc<dyn TsOracle>,
  bus: Box<dyn MsgBus>,
  coord: Arc<dyn DataCoordClient>,
  state: RwLock<NodeState>,
  // process-wide threshold below which recovered inserts are deduplicated;
  // initialized from one authoritative TSO read at startup
  filter_threshold: AtomicU64,
  graphs: RwLock<HashMap<String, FlowGraph>>,
  executor: CompactionExecutor,
}

impl DataNode {
  pub fn new(
    opts: &Opt,
    schema_service: Arc<dyn SchemaService>,
    store: Arc<dyn ObjectStore>,
    allocator: Arc<dyn IdAllocator>,
    oracle: Arc<dyn TsOracle>,
    bus: Box<dyn MsgBus>,
    coord: Arc<dyn DataCoordClient>,
  ) -> DataNode {
    DataNode {
      config: FlowGraphConfig::from(opts),
      compaction_parallelism: opts.compaction_parallelism,
      entity_ttl_seconds: opts.entity_ttl_seconds,
      schema_service,
      store,
      allocator,
      oracle,
      bus,
      coord,
      state: RwLock::new(NodeState::Initializing),
      filter_threshold: AtomicU64::new(0),
      graphs: RwLock::new(HashMap::new()),
      executor: CompactionExecutor::new(opts.compaction_parallelism),
    }
  }

  pub async fn init(&self) -> NodeResult<()> {
    let threshold = self
      .oracle
      .now()
      .await
      .with_context(|| "while fetching the startup filter threshold")?;
    self.filter_threshold.store(threshold, Ordering::SeqCst);
    *self.state.write().await = NodeState::Healthy;
    log::info!(
      "data node initialized (filter threshold {}, compaction parallelism {})",
      threshold, self.compaction_parallelism,
    );
    Ok(())
  }

  pub async fn state(&self) -> NodeState {
    *self.state.read().await
  }

  pub fn filter_threshold(&self) -> Timestamp {
    self.filter_threshold.load(Ordering::SeqCst)
  }

  async fn check_healthy(&self) -> NodeResult<()> {
    let state = *self.state.read().await;
    if state != NodeState::Healthy {
      return Err(NodeError::invalid(format!(
        "data node is not healthy (state {:?})",
        state,
      )));
    }
    Ok(())
  }

  // the watch loop's contract: create the matching flow graph once and
  // acknowledge by writing state = Complete back
  pub async fn handle_watch_event(&self, event: ChannelWatchInfo) -> NodeResult<ChannelWatchInfo> {
    self.check_healthy().await?;
    let channel = event.vchannel.channel.clone();
    {
      let graphs = self.graphs.read().await;
      if graphs.contains_key(&channel) {
        log::info!("channel {} already has a flow graph; acknowledging watch", channel);
        let mut ack = event;
        ack.state = WatchState::Complete;
        return Ok(ack);
      }
    }

    let graph = FlowGraph::build(
      &event.vchannel,
      self.config.clone(),
      self.filter_threshold(),
      self.schema_service.clone(),
      self.store.clone(),
      self.allocator.clone(),
      self.bus.as_ref(),
      self.coord.clone(),
    )
    .await
    .with_context(|| format!("while building flow graph for channel {}", channel))?;

    let mut graphs = self.graphs.write().await;
    graphs.insert(channel, graph);

    let mut ack = event;
    ack.state = WatchState::Complete;
    Ok(ack)
  }

  // flush the named segments; duplicates already in flight are idempotent,
  // unknown segments are an error. Segments in `mark_segment_ids` get a
  // non-terminal flush (their binlogs persist but they keep growing).
  pub async fn flush_segments(
    &self,
    collection_id: CollectionId,
    segment_ids: &[SegmentId],
    mark_segment_ids: &[SegmentId],
  ) -> NodeResult<()> {
    self.check_healthy().await?;
    let graphs = self.graphs.read().await;
    for (&segment_id, &flushed) in segment_ids
      .iter()
      .zip(std::iter::repeat(&true))
      .chain(mark_segment_ids.iter().zip(std::iter::repeat(&false)))
    {
      let mut routed = false;
      for graph in graphs.values() {
        if graph.collection_id() != collection_id {
          continue;
        }
        if graph.replica.has_segment(segment_id, true).await {
          graph.flush_segment(segment_id, flushed).await?;
          routed = true;
          break;
        }
      }
      if !routed {
        return Err(NodeError::does_not_exist("segment", segment_id));
      }
    }
    Ok(())
  }

  pub async fn compaction(&self, plan: CompactionPlan) -> NodeResult<()> {
    self.check_healthy().await?;
    let graphs = self.graphs.read().await;
    let graph = graphs.get(&plan.channel).ok_or_else(|| {
      NodeError::does_not_exist("flow graph for channel", &plan.channel)
    })?;
    let task = CompactionTask::new(
      plan,
      graph.replica.clone(),
      graph.flush_mgr.clone(),
      self.allocator.clone(),
      self.oracle.clone(),
      self.store.clone(),
      self.entity_ttl_seconds,
      self.config.flush_insert_buffer_size,
      self.config.io_retry_max_seconds,
    );
    self.executor.execute(task).await
  }

  pub async fn stop_compactions(&self, collection_id: CollectionId) {
    self.executor.stop_by_collection(collection_id).await;
  }

  pub fn executor(&self) -> &CompactionExecutor {
    &self.executor
  }

  pub async fn release_channel(&self, channel: &str) {
    let mut graphs = self.graphs.write().await;
    if let Some(mut graph) = graphs.remove(channel) {
      self.executor.stop_by_collection(graph.collection_id()).await;
      graph.close().await;
    }
  }

  pub async fn metrics(&self) -> serde_json::Value {
    let graphs = self.graphs.read().await;
    serde_json::json!({
      "state": format!("{:?}", *self.state.read().await),
      "channels": graphs.keys().collect::<Vec<_>>(),
      "running_compactions": self.executor.running_count().await,
    })
  }

  pub async fn stop(&self) {
    let mut graphs = self.graphs.write().await;
    for (_, mut graph) in graphs.drain() {
      graph.close().await;
    }
    *self.state.write().await = NodeState::Stopped;
    log::info!("data node stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  use structopt::StructOpt;

  use crate::buffer::tests::{insert_msg, test_schema};
  use crate::external::allocator::{LocalIdAllocator, LocalTsOracle};
  use crate::external::data_coord::RecordingCoordClient;
  use crate::external::meta::StaticSchemaService;
  use crate::external::msg_stream::{MemoryBus, MsgBus, MsgProducer};
  use crate::external::object_store::MemoryObjectStore;
  use crate::msg::{BusMsg, MsgPack};
  use crate::types::StreamPosition;
  use crate::watch::VchannelInfo;

  fn test_opts() -> Opt {
    // 256 bytes = 16 rows of the dim-4 test schema
    Opt::from_iter(&[
      "siltdb-datanode",
      "--flush-insert-buffer-size", "256",
      "--sync-interval-millis", "10",
      "--io-retry-max-seconds", "1",
    ])
  }

  struct Harness {
    node: DataNode,
    coord: Arc<RecordingCoordClient>,
    producer: Box<dyn MsgProducer>,
  }

  async fn harness() -> Harness {
    let schema_service = Arc::new(StaticSchemaService::new());
    schema_service.register_collection(1, test_schema(4)).await;
    let bus = MemoryBus::new(64);
    let coord = Arc::new(RecordingCoordClient::new());
    let node = DataNode::new(
      &test_opts(),
      schema_service,
      Arc::new(MemoryObjectStore::new()),
      Arc::new(LocalIdAllocator::new(1)),
      Arc::new(LocalTsOracle::new()),
      Box::new(bus.clone()),
      coord.clone(),
    );
    node.init().await.unwrap();

    let event = ChannelWatchInfo {
      vchannel: VchannelInfo {
        collection_id: 1,
        channel: "ch-1".to_string(),
        seek_position: None,
        unflushed_segments: vec![],
        flushed_segments: vec![],
      },
      state: WatchState::Uncomplete,
    };
    let ack = node.handle_watch_event(event).await.unwrap();
    assert_eq!(ack.state, WatchState::Complete);

    let producer = bus.as_producer("ch-1").await.unwrap();
    Harness { node, coord, producer }
  }

  fn pos(ts: u64) -> StreamPosition {
    StreamPosition::new("bus-ch-1", ts.to_le_bytes().to_vec(), ts)
  }

  fn insert_pack(segment_id: i64, pks: &[i64], ts: u64) -> MsgPack {
    MsgPack {
      msgs: vec![BusMsg::Insert(insert_msg(segment_id, pks))],
      start_positions: vec![pos(1)],
      end_positions: vec![pos(ts)],
      time_range: (0, ts * 100),
    }
  }

  fn empty_pack(ts: u64) -> MsgPack {
    MsgPack {
      msgs: vec![],
      start_positions: vec![pos(1)],
      end_positions: vec![pos(ts)],
      time_range: (0, ts * 100),
    }
  }

  async fn await_saved(coord: &RecordingCoordClient, n: usize) {
    for _ in 0..200 {
      if coord.saved.lock().await.len() >= n {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("coordinator never received {} SaveBinlogPaths calls", n);
  }

  #[tokio::test]
  async fn test_end_to_end_auto_flush_reports_binlogs() {
    let hx = harness().await;

    hx.producer
      .produce(insert_pack(5, &(1..=16).collect::<Vec<i64>>(), 2))
      .await
      .unwrap();

    await_saved(&hx.coord, 1).await;
    let saved = hx.coord.saved.lock().await;
    let req = &saved[0];
    assert_eq!(req.segment_id, 5);
    assert_eq!(req.collection_id, 1);
    assert!(!req.flushed);
    assert!(!req.insert_logs.is_empty());
    assert!(!req.stats_logs.is_empty());
    // the segment's start position was reported alongside the first flush
    assert!(req.start_positions.iter().any(|cp| cp.segment_id == 5)
      || req.checkpoints.iter().any(|cp| cp.segment_id == 5));
  }

  #[tokio::test]
  async fn test_flush_segments_is_idempotent_and_terminal() {
    let hx = harness().await;

    hx.producer
      .produce(insert_pack(5, &(1..=10).collect::<Vec<i64>>(), 2))
      .await
      .unwrap();
    // let the tick land before requesting the flush
    tokio::time::sleep(Duration::from_millis(50)).await;

    hx.node.flush_segments(1, &[5], &[]).await.unwrap();
    // the request is polled on the next tick
    hx.producer.produce(empty_pack(3)).await.unwrap();

    await_saved(&hx.coord, 1).await;
    {
      let saved = hx.coord.saved.lock().await;
      assert!(saved[0].flushed);
      assert_eq!(saved[0].segment_id, 5);
    }

    // a duplicate request for an already-flushed segment is a quiet success
    hx.node.flush_segments(1, &[5], &[]).await.unwrap();
    hx.producer.produce(empty_pack(4)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hx.coord.saved.lock().await.len(), 1);
  }

  #[tokio::test]
  async fn test_flush_unknown_segment_is_an_error() {
    let hx = harness().await;
    let res = hx.node.flush_segments(1, &[999], &[]).await;
    assert!(res.is_err());
  }

  #[tokio::test]
  async fn test_requests_rejected_while_unhealthy() {
    let hx = harness().await;
    hx.node.stop().await;
    assert_eq!(hx.node.state().await, NodeState::Stopped);
    assert!(hx.node.flush_segments(1, &[5], &[]).await.is_err());
    let plan = crate::msg::CompactionPlan {
      plan_id: 1,
      collection_id: 1,
      channel: "ch-1".to_string(),
      compaction_type: crate::msg::CompactionType::Merge,
      timeout_seconds: 10,
      time_travel_ts: 0,
      segment_binlogs: vec![],
    };
    assert!(hx.node.compaction(plan).await.is_err());
  }

  #[tokio::test]
  async fn test_watch_event_is_idempotent() {
    let hx = harness().await;
    let event = ChannelWatchInfo {
      vchannel: VchannelInfo {
        collection_id: 1,
        channel: "ch-1".to_string(),
        seek_position: None,
        unflushed_segments: vec![],
        flushed_segments: vec![],
      },
      state: WatchState::Uncomplete,
    };
    let ack = hx.node.handle_watch_event(event).await.unwrap();
    assert_eq!(ack.state, WatchState::Complete);
    assert_eq!(hx.node.graphs.read().await.len(), 1);
  }
}
