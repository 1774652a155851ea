use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::buffer::BufferData;
use crate::errors::{NodeError, NodeResult};
use crate::external::data_coord::DataCoordClient;
use crate::flow::ticker::MergedTimeTicker;
use crate::flush::FlushManager;
use crate::msg::{FlowGraphMsg, FlushRequest, SegmentStatsUpdate};
use crate::replica::Replica;
use crate::types::SegmentId;

// buffers inserts per segment, triggers auto-flush on full buffers, folds in
// manual flush requests, and reports row statistics upstream
pub struct InsertBufferNode {
  channel: String,
  replica: Arc<Replica>,
  flush_mgr: Arc<FlushManager>,
  coord: Arc<dyn DataCoordClient>,
  ticker: MergedTimeTicker,
  flush_req_rx: mpsc::Receiver<FlushRequest>,
  buffers: HashMap<SegmentId, BufferData>,
  budget_bytes: u64,
}

impl InsertBufferNode {
  pub fn new(
    channel: impl Into<String>,
    replica: Arc<Replica>,
    flush_mgr: Arc<FlushManager>,
    coord: Arc<dyn DataCoordClient>,
    ticker: MergedTimeTicker,
    flush_req_rx: mpsc::Receiver<FlushRequest>,
    budget_bytes: u64,
  ) -> InsertBufferNode {
    InsertBufferNode {
      channel: channel.into(),
      replica,
      flush_mgr,
      coord,
      ticker,
      flush_req_rx,
      buffers: HashMap::new(),
      budget_bytes,
    }
  }

  pub async fn operate(&mut self, mut msg: FlowGraphMsg) -> NodeResult<FlowGraphMsg> {
    if msg.drop_collection {
      // graph is draining; abandon buffered data, nothing may flush anymore
      self.buffers.clear();
      return Ok(msg);
    }

    // positions always name the owning channel, whatever the bus called it
    for pos in msg.start_positions.iter_mut().chain(msg.end_positions.iter_mut()) {
      pos.channel = self.channel.clone();
    }

    self.update_segment_states(&msg).await;
    self.buffer_insert_msgs(&msg).await;

    // auto-flush everything whose buffer ran out of capacity
    let mut to_flush: Vec<FlushRequest> = self
      .buffers
      .iter()
      .filter(|(_, buffer)| buffer.is_full())
      .map(|(&segment_id, _)| FlushRequest { segment_id, flushed: false })
      .collect();

    // fold in externally requested flushes without double-flushing
    while let Ok(req) = self.flush_req_rx.try_recv() {
      match to_flush.iter_mut().find(|f| f.segment_id == req.segment_id) {
        Some(existing) => existing.flushed = req.flushed,
        None => to_flush.push(req),
      }
    }

    let end_pos = match msg.end_positions.last() {
      Some(pos) => pos.clone(),
      None if to_flush.is_empty() => {
        self.ticker.tick(msg.time_range.1);
        return Ok(msg);
      }
      None => {
        return Err(NodeError::invalid(format!(
          "channel {} tick carries flush work but no end position",
          self.channel,
        )))
      }
    };

    for req in to_flush {
      let buffer = match self.buffers.remove(&req.segment_id) {
        Some(buffer) => buffer,
        // a manual flush may name a segment with nothing buffered; it still
        // deserves a terminal pack carrying its stats
        None => match self.empty_buffer().await {
          Ok(buffer) => buffer,
          Err(e) => {
            log::warn!(
              "channel {} cannot build flush buffer for segment {}: {}",
              self.channel, req.segment_id, e,
            );
            continue;
          }
        },
      };
      let rows = buffer.size;
      match self
        .flush_mgr
        .flush_buffer_data(buffer, req.segment_id, req.flushed, end_pos.clone())
        .await
      {
        Ok(()) => {
          log::info!(
            "channel {} submitted flush of {} rows for segment {} (terminal: {})",
            self.channel, rows, req.segment_id, req.flushed,
          );
          self.replica.update_segment_checkpoint(req.segment_id).await;
          if req.flushed {
            self.replica.segment_flushed(req.segment_id).await;
          }
          msg.segments_to_flush.push(req.segment_id);
        }
        Err(e) => {
          log::error!(
            "channel {} failed to submit flush for segment {}: {}",
            self.channel, req.segment_id, e,
          );
        }
      }
    }

    self.ticker.tick(msg.time_range.1);
    Ok(msg)
  }

  // register unseen segments, accumulate row-count deltas, and publish the
  // updated statistics upstream
  async fn update_segment_states(&mut self, msg: &FlowGraphMsg) {
    let mut deltas: HashMap<SegmentId, i64> = HashMap::new();
    for insert in &msg.insert_msgs {
      let known = self.replica.has_segment(insert.segment_id, true).await;
      if !known {
        let start_pos = msg
          .start_positions
          .first()
          .cloned()
          .unwrap_or_else(|| crate::types::StreamPosition::new(&self.channel, vec![], 0));
        let end_pos = msg
          .end_positions
          .last()
          .cloned()
          .unwrap_or_else(|| start_pos.clone());
        if let Err(e) = self
          .replica
          .add_new_segment(
            insert.segment_id,
            insert.collection_id,
            insert.partition_id,
            &self.channel,
            start_pos,
            end_pos,
          )
          .await
        {
          log::warn!(
            "channel {} failed to register segment {}: {}",
            self.channel, insert.segment_id, e,
          );
          continue;
        }
      }
      *deltas.entry(insert.segment_id).or_insert(0) += insert.rows.len() as i64;
      if let Some(end_pos) = msg.end_positions.last() {
        self.replica
          .update_segment_end_position(insert.segment_id, end_pos)
          .await;
      }
    }

    let mut stats = Vec::with_capacity(deltas.len());
    for (segment_id, delta) in deltas {
      if let Err(e) = self.replica.update_statistics(segment_id, delta).await {
        log::warn!(
          "channel {} failed to update statistics for segment {}: {}",
          self.channel, segment_id, e,
        );
        continue;
      }
      if let Some(num_rows) = self.replica.segment_num_rows(segment_id).await {
        stats.push(SegmentStatsUpdate { segment_id, num_rows });
      }
    }
    if !stats.is_empty() {
      // coordinator statistics are advisory; a failure is logged, not retried
      if let Err(e) = self.coord.report_segment_stats(stats).await {
        log::warn!("channel {} failed to report segment statistics: {}", self.channel, e);
      }
    }
  }

  async fn buffer_insert_msgs(&mut self, msg: &FlowGraphMsg) {
    if msg.insert_msgs.is_empty() {
      return;
    }
    let schema = match self.replica.collection_schema(0).await {
      Ok(schema) => schema,
      Err(e) => {
        log::warn!("channel {} cannot resolve schema: {}", self.channel, e);
        return;
      }
    };
    for insert in &msg.insert_msgs {
      if !self.buffers.contains_key(&insert.segment_id) {
        match BufferData::new(&schema, self.budget_bytes) {
          Ok(buffer) => {
            self.buffers.insert(insert.segment_id, buffer);
          }
          Err(e) => {
            log::warn!(
              "channel {} cannot create buffer for segment {}: {}",
              self.channel, insert.segment_id, e,
            );
            continue;
          }
        }
      }
      let buffer = match self.buffers.get_mut(&insert.segment_id) {
        Some(buffer) => buffer,
        None => continue,
      };
      // a bad message fails alone; the tick forwards whatever else succeeded
      match buffer.buffer_insert_msg(&schema, insert) {
        Ok(pks) => {
          self.replica
            .update_segment_pk_range(insert.segment_id, &pks)
            .await;
        }
        Err(e) => {
          log::error!(
            "channel {} failed to buffer insert for segment {}: {}",
            self.channel, insert.segment_id, e,
          );
        }
      }
    }
  }

  async fn empty_buffer(&self) -> NodeResult<BufferData> {
    let schema = self.replica.collection_schema(0).await?;
    BufferData::new(&schema, self.budget_bytes)
  }

  pub fn close(&mut self) {
    self.ticker.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::mpsc;

  use crate::buffer::tests::{insert_msg, test_schema};
  use crate::external::allocator::LocalIdAllocator;
  use crate::external::data_coord::RecordingCoordClient;
  use crate::external::meta::StaticSchemaService;
  use crate::external::object_store::MemoryObjectStore;
  use crate::msg::FlushPack;
  use crate::types::{PkValue, SegmentState, StreamPosition};

  struct Fixture {
    node: InsertBufferNode,
    replica: Arc<Replica>,
    coord: Arc<RecordingCoordClient>,
    notify_rx: mpsc::Receiver<FlushPack>,
    flush_req_tx: mpsc::Sender<FlushRequest>,
  }

  // budget of 256 bytes = 16 rows of a dim-4 float vector
  async fn fixture() -> Fixture {
    let schema_service = Arc::new(StaticSchemaService::new());
    schema_service.register_collection(1, test_schema(4)).await;
    let store = Arc::new(MemoryObjectStore::new());
    let replica = Arc::new(Replica::new(1, "ch-1", schema_service, store.clone()));
    let (notify_tx, notify_rx) = mpsc::channel(16);
    let flush_mgr = Arc::new(FlushManager::new(
      "ch-1",
      replica.clone(),
      store,
      Arc::new(LocalIdAllocator::new(1000)),
      notify_tx,
      1,
    ));
    let coord = Arc::new(RecordingCoordClient::new());
    let ticker = MergedTimeTicker::new("ch-1", 10, coord.clone());
    let (flush_req_tx, flush_req_rx) = mpsc::channel(16);
    let node = InsertBufferNode::new(
      "ch-1",
      replica.clone(),
      flush_mgr,
      coord.clone(),
      ticker,
      flush_req_rx,
      256,
    );
    Fixture { node, replica, coord, notify_rx, flush_req_tx }
  }

  fn pos(ts: u64) -> StreamPosition {
    StreamPosition::new("bus-topic-7", ts.to_le_bytes().to_vec(), ts)
  }

  fn tick(pks: &[i64], ts: u64) -> FlowGraphMsg {
    FlowGraphMsg {
      insert_msgs: if pks.is_empty() { vec![] } else { vec![insert_msg(5, pks)] },
      start_positions: vec![pos(1)],
      end_positions: vec![pos(ts)],
      time_range: (0, ts * 100),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_auto_flush_on_full_buffer() {
    let mut fx = fixture().await;

    // 10 rows: no flush yet
    let out = fx.node.operate(tick(&(1..=10).collect::<Vec<i64>>(), 2)).await.unwrap();
    assert!(out.segments_to_flush.is_empty());
    assert_eq!(fx.replica.segment_num_rows(5).await, Some(10));

    // 6 more rows fill the 16-row limit exactly
    let out = fx.node.operate(tick(&(11..=16).collect::<Vec<i64>>(), 3)).await.unwrap();
    assert_eq!(out.segments_to_flush, vec![5]);

    let pack = fx.notify_rx.recv().await.unwrap();
    assert!(pack.err.is_none());
    assert_eq!(pack.segment_id, 5);
    assert!(!pack.flushed);
    assert!(!pack.stats_logs.is_empty());
    // buffer was consumed; the segment stays growing
    assert!(fx.node.buffers.get(&5).is_none());
    assert_ne!(fx.replica.segment_state(5).await, Some(SegmentState::Flushed));

    // positions were rewritten to the owning channel
    assert_eq!(pack.pos.unwrap().channel, "ch-1");

    // statistics were published with the accumulated row count
    let stats = fx.coord.stats.lock().await;
    assert_eq!(stats.last().unwrap(), &crate::msg::SegmentStatsUpdate {
      segment_id: 5,
      num_rows: 16,
    });

    // pk range made it into the replica
    let pk_stats = fx.replica.segment_pk_stats(5).await.unwrap();
    assert_eq!(pk_stats.min, Some(PkValue::Int(1)));
    assert_eq!(pk_stats.max, Some(PkValue::Int(16)));
    assert!(pk_stats.filter.contains(&PkValue::Int(3)));
  }

  #[tokio::test]
  async fn test_manual_flush_marks_segment_flushed() {
    let mut fx = fixture().await;
    fx.node.operate(tick(&(1..=10).collect::<Vec<i64>>(), 2)).await.unwrap();

    fx.flush_req_tx
      .send(FlushRequest { segment_id: 5, flushed: true })
      .await
      .unwrap();
    let out = fx.node.operate(tick(&[], 3)).await.unwrap();
    assert_eq!(out.segments_to_flush, vec![5]);

    let pack = fx.notify_rx.recv().await.unwrap();
    assert!(pack.flushed);
    assert_eq!(fx.replica.segment_state(5).await, Some(SegmentState::Flushed));
  }

  #[tokio::test]
  async fn test_manual_request_merges_with_auto_flush() {
    let mut fx = fixture().await;
    fx.node.operate(tick(&(1..=10).collect::<Vec<i64>>(), 2)).await.unwrap();

    // the buffer fills this tick AND an external request names the segment;
    // exactly one pack results, carrying the request's terminal flag
    fx.flush_req_tx
      .send(FlushRequest { segment_id: 5, flushed: true })
      .await
      .unwrap();
    let out = fx.node.operate(tick(&(11..=16).collect::<Vec<i64>>(), 3)).await.unwrap();
    assert_eq!(out.segments_to_flush, vec![5]);

    let pack = fx.notify_rx.recv().await.unwrap();
    assert!(pack.flushed);
    assert!(fx.notify_rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_misaligned_message_does_not_stall_tick() {
    let mut fx = fixture().await;
    let mut bad = insert_msg(5, &[1, 2, 3]);
    bad.timestamps.pop();
    let good = insert_msg(6, &[4]);
    let msg = FlowGraphMsg {
      insert_msgs: vec![bad, good],
      start_positions: vec![pos(1)],
      end_positions: vec![pos(2)],
      time_range: (0, 200),
      ..Default::default()
    };
    fx.node.operate(msg).await.unwrap();
    // the good message landed
    assert_eq!(fx.node.buffers.get(&6).map(|b| b.size), Some(1));
  }

  #[tokio::test]
  async fn test_drop_collection_clears_buffers() {
    let mut fx = fixture().await;
    fx.node.operate(tick(&(1..=10).collect::<Vec<i64>>(), 2)).await.unwrap();
    assert!(!fx.node.buffers.is_empty());

    let mut msg = tick(&[], 3);
    msg.drop_collection = true;
    fx.node.operate(msg).await.unwrap();
    assert!(fx.node.buffers.is_empty());
  }
}
