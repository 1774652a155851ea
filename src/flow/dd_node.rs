use std::collections::{HashMap, HashSet};

use crate::errors::{NodeError, NodeResult};
use crate::external::msg_stream::MsgProducer;
use crate::msg::{BusMsg, FlowGraphMsg, InsertMsg, MsgPack};
use crate::types::{CollectionId, SegmentId, StreamPosition, Timestamp};
use crate::watch::VchannelInfo;

// first node of every flow graph: dedupes recovered writes, routes deletes
// onto the delta output stream, and detects DropCollection
pub struct DdNode {
  channel: String,
  collection_id: CollectionId,
  flushed_segments: HashSet<SegmentId>,
  // unflushed segment recovery positions; an entry is retired once a write
  // strictly past it shows up
  seg_positions: HashMap<SegmentId, StreamPosition>,
  drop_mode: bool,
  filter_threshold: Timestamp,
  delta_producer: Box<dyn MsgProducer>,
  io_retry_max_seconds: u64,
}

impl DdNode {
  pub fn new(
    vchannel: &VchannelInfo,
    filter_threshold: Timestamp,
    delta_producer: Box<dyn MsgProducer>,
    io_retry_max_seconds: u64,
  ) -> DdNode {
    let flushed_segments = vchannel
      .flushed_segments
      .iter()
      .map(|info| info.segment_id)
      .collect();
    let seg_positions = vchannel
      .unflushed_segments
      .iter()
      .map(|info| (info.segment_id, info.dml_position.clone()))
      .collect();
    DdNode {
      channel: vchannel.channel.clone(),
      collection_id: vchannel.collection_id,
      flushed_segments,
      seg_positions,
      drop_mode: false,
      filter_threshold,
      delta_producer,
      io_retry_max_seconds,
    }
  }

  // true when the message is already covered by persisted state and must be
  // dropped
  fn filter_flushed_segment_insert(&mut self, msg: &InsertMsg) -> bool {
    if self.flushed_segments.contains(&msg.segment_id) {
      return true;
    }
    match self.seg_positions.get(&msg.segment_id) {
      Some(pos) if msg.end_ts() <= pos.timestamp => true,
      Some(_) => {
        // recovery for this segment is complete
        self.seg_positions.remove(&msg.segment_id);
        false
      }
      None => false,
    }
  }

  async fn forward_deletes(
    &self,
    deletes: Vec<BusMsg>,
    pack: &MsgPack,
    max_ts: Timestamp,
  ) -> NodeResult<()> {
    let delta_pack = MsgPack {
      msgs: deletes,
      start_positions: pack.start_positions.clone(),
      end_positions: pack.end_positions.clone(),
      // the delta time tick: downstream consumers advance to the packet's
      // max timestamp even when no deletes flowed
      time_range: (pack.time_range.0, max_ts),
    };

    // losing a delete silently is never acceptable; exhausted retries take
    // the whole graph down
    crate::utils::retry_io(self.io_retry_max_seconds, || {
      self.delta_producer.produce(delta_pack.clone())
    })
    .await
    .map_err(|e| {
      NodeError::fatal_io(format!(
        "channel {} failed to forward deletes to the delta stream: {}",
        self.channel, e,
      ))
    })
  }

  pub async fn operate(&mut self, pack: MsgPack) -> NodeResult<FlowGraphMsg> {
    let mut out = FlowGraphMsg {
      start_positions: pack.start_positions.clone(),
      end_positions: pack.end_positions.clone(),
      time_range: pack.time_range,
      ..Default::default()
    };

    if self.drop_mode {
      // graph is draining; emit empty batches until teardown
      return Ok(out);
    }

    let mut forward: Vec<BusMsg> = Vec::new();
    let mut max_ts = pack.time_range.1;
    for msg in &pack.msgs {
      match msg {
        BusMsg::DropCollection(drop) => {
          if drop.collection_id == self.collection_id {
            log::info!(
              "channel {} received DropCollection for collection {}; entering drop mode",
              self.channel, self.collection_id,
            );
            self.drop_mode = true;
            out.drop_collection = true;
          }
        }
        BusMsg::Insert(insert) => {
          if insert.collection_id != self.collection_id {
            log::warn!(
              "channel {} dropping insert for foreign collection {}",
              self.channel, insert.collection_id,
            );
            continue;
          }
          if insert.end_ts() < self.filter_threshold
            && self.filter_flushed_segment_insert(insert)
          {
            log::debug!(
              "channel {} filtered recovered insert for segment {} (end ts {})",
              self.channel,
              insert.segment_id,
              insert.end_ts(),
            );
            continue;
          }
          out.insert_msgs.push(insert.clone());
        }
        BusMsg::Delete(delete) => {
          max_ts = max_ts.max(delete.max_ts());
          forward.push(BusMsg::Delete(delete.clone()));
          if delete.collection_id == self.collection_id {
            out.delete_msgs.push(delete.clone());
          }
        }
      }
    }

    self.forward_deletes(forward, &pack, max_ts).await?;
    Ok(out)
  }

  pub fn in_drop_mode(&self) -> bool {
    self.drop_mode
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use tokio::sync::Mutex;

  use async_trait::async_trait;

  use crate::msg::{DeleteMsg, DropCollectionMsg};
  use crate::types::PkValue;
  use crate::watch::SegmentRecoveryInfo;

  struct SinkProducer {
    packs: Arc<Mutex<Vec<MsgPack>>>,
  }

  #[async_trait]
  impl MsgProducer for SinkProducer {
    async fn produce(&self, pack: MsgPack) -> NodeResult<()> {
      self.packs.lock().await.push(pack);
      Ok(())
    }
  }

  fn vchannel() -> VchannelInfo {
    VchannelInfo {
      collection_id: 1,
      channel: "ch-1".to_string(),
      seek_position: None,
      unflushed_segments: vec![SegmentRecoveryInfo {
        segment_id: 300,
        partition_id: 10,
        num_rows: 10,
        dml_position: StreamPosition::new("ch-1", vec![], 2500),
        stats_log_paths: vec![],
      }],
      flushed_segments: vec![crate::watch::FlushedSegmentInfo {
        segment_id: 100,
        partition_id: 10,
        num_rows: 10,
        stats_log_paths: vec![],
      }],
    }
  }

  fn insert(segment_id: SegmentId, end_ts: Timestamp) -> BusMsg {
    BusMsg::Insert(InsertMsg {
      collection_id: 1,
      partition_id: 10,
      segment_id,
      channel: "ch-1".to_string(),
      row_ids: vec![1],
      timestamps: vec![end_ts],
      rows: vec![vec![]],
    })
  }

  fn node() -> (DdNode, Arc<Mutex<Vec<MsgPack>>>) {
    let packs = Arc::new(Mutex::new(Vec::new()));
    let producer = Box::new(SinkProducer { packs: packs.clone() });
    (DdNode::new(&vchannel(), 3000, producer, 1), packs)
  }

  #[tokio::test]
  async fn test_filters_recovered_segments_below_threshold() {
    let (mut dd, _) = node();
    let pack = MsgPack {
      msgs: vec![insert(100, 2000), insert(200, 2000), insert(100, 4000)],
      time_range: (0, 4000),
      ..Default::default()
    };
    let out = dd.operate(pack).await.unwrap();

    // flushed segment below threshold dropped; unknown segment forwarded;
    // above threshold forwarded even for a flushed segment
    let segs: Vec<SegmentId> = out.insert_msgs.iter().map(|m| m.segment_id).collect();
    assert_eq!(segs, vec![200, 100]);
  }

  #[tokio::test]
  async fn test_unflushed_recovery_position_filters_then_retires() {
    let (mut dd, _) = node();
    let covered = MsgPack {
      msgs: vec![insert(300, 2500)],
      time_range: (0, 2500),
      ..Default::default()
    };
    assert!(dd.operate(covered).await.unwrap().insert_msgs.is_empty());

    // strictly past the recovery position: forwarded, entry retired
    let past = MsgPack {
      msgs: vec![insert(300, 2600)],
      time_range: (0, 2600),
      ..Default::default()
    };
    assert_eq!(dd.operate(past).await.unwrap().insert_msgs.len(), 1);
    assert!(!dd.seg_positions.contains_key(&300));
  }

  #[tokio::test]
  async fn test_deletes_forward_to_delta_stream() {
    let (mut dd, packs) = node();
    let pack = MsgPack {
      msgs: vec![BusMsg::Delete(DeleteMsg {
        collection_id: 1,
        partition_id: 10,
        channel: "ch-1".to_string(),
        pks: vec![PkValue::Int(7)],
        timestamps: vec![5000],
      })],
      time_range: (0, 4000),
      ..Default::default()
    };
    let out = dd.operate(pack).await.unwrap();
    assert_eq!(out.delete_msgs.len(), 1);

    let forwarded = packs.lock().await;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].msgs.len(), 1);
    // delta tick advanced to the max timestamp seen
    assert_eq!(forwarded[0].time_range.1, 5000);
  }

  #[tokio::test]
  async fn test_drop_collection_silences_channel() {
    let (mut dd, _) = node();
    let pack = MsgPack {
      msgs: vec![BusMsg::DropCollection(DropCollectionMsg { collection_id: 1 })],
      ..Default::default()
    };
    let out = dd.operate(pack).await.unwrap();
    assert!(out.drop_collection);

    let later = MsgPack {
      msgs: vec![insert(999, 9000)],
      ..Default::default()
    };
    let out = dd.operate(later).await.unwrap();
    assert!(out.insert_msgs.is_empty());
    assert!(!out.drop_collection);
  }
}
