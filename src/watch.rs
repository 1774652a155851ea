use serde::{Deserialize, Serialize};

use crate::types::{CollectionId, PartitionId, SegmentId, StreamPosition};

// recovery info for one unflushed segment: where its last recovered write
// sits on the stream
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentRecoveryInfo {
  pub segment_id: SegmentId,
  pub partition_id: PartitionId,
  pub num_rows: i64,
  pub dml_position: StreamPosition,
  pub stats_log_paths: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushedSegmentInfo {
  pub segment_id: SegmentId,
  pub partition_id: PartitionId,
  pub num_rows: i64,
  pub stats_log_paths: Vec<String>,
}

// everything the discovery loop knows about one virtual channel
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VchannelInfo {
  pub collection_id: CollectionId,
  pub channel: String,
  pub seek_position: Option<StreamPosition>,
  pub unflushed_segments: Vec<SegmentRecoveryInfo>,
  pub flushed_segments: Vec<FlushedSegmentInfo>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchState {
  Uncomplete,
  Complete,
}

// delivered by the watch loop; the node creates the matching flow graph once
// and acknowledges by writing state = Complete back
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelWatchInfo {
  pub vchannel: VchannelInfo,
  pub state: WatchState,
}
