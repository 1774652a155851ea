use std::collections::HashMap;

use crate::codec::delete::DeleteData;
use crate::errors::{NodeError, NodeResult};
use crate::types::{
  CollectionId, FieldId, PartitionId, PkValue, SegmentId, StreamPosition, Timestamp,
};

// one insert batch as it arrives off the bus; rows are opaque payload blobs
// decoded per the collection schema
#[derive(Clone, Debug)]
pub struct InsertMsg {
  pub collection_id: CollectionId,
  pub partition_id: PartitionId,
  pub segment_id: SegmentId,
  pub channel: String,
  pub row_ids: Vec<i64>,
  pub timestamps: Vec<Timestamp>,
  pub rows: Vec<Vec<u8>>,
}

impl InsertMsg {
  pub fn end_ts(&self) -> Timestamp {
    self.timestamps.iter().copied().max().unwrap_or(0)
  }

  // row ids, timestamps and payloads must line up one-to-one
  pub fn check_aligned(&self) -> NodeResult<()> {
    if self.row_ids.len() != self.timestamps.len() || self.row_ids.len() != self.rows.len() {
      return Err(NodeError::invalid(format!(
        "misaligned insert message for segment {}: {} row ids, {} timestamps, {} rows",
        self.segment_id,
        self.row_ids.len(),
        self.timestamps.len(),
        self.rows.len(),
      )));
    }
    Ok(())
  }
}

#[derive(Clone, Debug)]
pub struct DeleteMsg {
  pub collection_id: CollectionId,
  pub partition_id: PartitionId,
  pub channel: String,
  pub pks: Vec<PkValue>,
  pub timestamps: Vec<Timestamp>,
}

impl DeleteMsg {
  pub fn max_ts(&self) -> Timestamp {
    self.timestamps.iter().copied().max().unwrap_or(0)
  }
}

#[derive(Clone, Debug)]
pub struct DropCollectionMsg {
  pub collection_id: CollectionId,
}

#[derive(Clone, Debug)]
pub enum BusMsg {
  Insert(InsertMsg),
  Delete(DeleteMsg),
  DropCollection(DropCollectionMsg),
}

// a consumer tick: messages annotated with positions and the time range they
// cover
#[derive(Clone, Debug, Default)]
pub struct MsgPack {
  pub msgs: Vec<BusMsg>,
  pub start_positions: Vec<StreamPosition>,
  pub end_positions: Vec<StreamPosition>,
  pub time_range: (Timestamp, Timestamp),
}

// the unit passed edge-to-edge inside one flow graph
#[derive(Clone, Debug, Default)]
pub struct FlowGraphMsg {
  pub insert_msgs: Vec<InsertMsg>,
  pub delete_msgs: Vec<DeleteMsg>,
  pub start_positions: Vec<StreamPosition>,
  pub end_positions: Vec<StreamPosition>,
  pub time_range: (Timestamp, Timestamp),
  pub segments_to_flush: Vec<SegmentId>,
  pub drop_collection: bool,
}

// an external request to flush one segment, polled by the insert-buffer node
#[derive(Clone, Copy, Debug)]
pub struct FlushRequest {
  pub segment_id: SegmentId,
  pub flushed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeltaLogInfo {
  pub path: String,
  pub size: u64,
  pub ts_from: Timestamp,
  pub ts_to: Timestamp,
  pub entries: u64,
}

// one segment's flush outcome, consumed exactly once off the notification
// channel
#[derive(Debug, Default)]
pub struct FlushPack {
  pub segment_id: SegmentId,
  pub collection_id: CollectionId,
  pub insert_logs: HashMap<FieldId, String>,
  pub stats_logs: HashMap<FieldId, String>,
  pub delta_logs: Vec<DeltaLogInfo>,
  pub pos: Option<StreamPosition>,
  pub flushed: bool,
  pub err: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentStatsUpdate {
  pub segment_id: SegmentId,
  pub num_rows: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionType {
  Undefined,
  Merge,
  Mix,
}

#[derive(Clone, Debug)]
pub struct FieldBinlogPaths {
  pub field_id: FieldId,
  pub paths: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SegmentBinlogs {
  pub segment_id: SegmentId,
  pub field_binlogs: Vec<FieldBinlogPaths>,
  pub delta_logs: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CompactionPlan {
  pub plan_id: crate::types::PlanId,
  pub collection_id: CollectionId,
  pub channel: String,
  pub compaction_type: CompactionType,
  pub timeout_seconds: u64,
  pub time_travel_ts: Timestamp,
  pub segment_binlogs: Vec<SegmentBinlogs>,
}

#[derive(Debug)]
pub struct CompactionResult {
  pub plan_id: crate::types::PlanId,
  pub target_segment_id: SegmentId,
  pub insert_logs: Vec<FieldBinlogPaths>,
  pub stats_logs: Vec<FieldBinlogPaths>,
  pub delta_logs: Vec<DeltaLogInfo>,
  pub num_rows: i64,
}

// staged deletes for one segment, with a running timestamp range summary
#[derive(Clone, Debug, Default)]
pub struct DelDataBuf {
  pub data: DeleteData,
  pub ts_from: Timestamp,
  pub ts_to: Timestamp,
}

impl DelDataBuf {
  pub fn append(&mut self, pk: PkValue, ts: Timestamp) {
    if self.data.row_count() == 0 {
      self.ts_from = ts;
      self.ts_to = ts;
    } else {
      self.ts_from = self.ts_from.min(ts);
      self.ts_to = self.ts_to.max(ts);
    }
    self.data.append(pk, ts);
  }

  pub fn entries(&self) -> usize {
    self.data.row_count()
  }
}
