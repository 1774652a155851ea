use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::NodeResult;
use crate::msg::{DeltaLogInfo, SegmentStatsUpdate};
use crate::types::{CollectionId, FieldId, SegmentId, StreamPosition, Timestamp};

#[derive(Clone, Debug)]
pub struct SegmentCheckpointInfo {
  pub segment_id: SegmentId,
  pub num_rows: i64,
  pub position: StreamPosition,
}

#[derive(Clone, Debug)]
pub struct SaveBinlogPathsRequest {
  pub segment_id: SegmentId,
  pub collection_id: CollectionId,
  pub insert_logs: HashMap<FieldId, String>,
  pub stats_logs: HashMap<FieldId, String>,
  pub delta_logs: Vec<DeltaLogInfo>,
  pub checkpoints: Vec<SegmentCheckpointInfo>,
  pub start_positions: Vec<SegmentCheckpointInfo>,
  pub flushed: bool,
}

// outbound RPCs to the coordinator; failures here are logged and counted by
// the caller, never retried at this layer
#[async_trait]
pub trait DataCoordClient: Send + Sync {
  async fn save_binlog_paths(&self, req: SaveBinlogPathsRequest) -> NodeResult<()>;

  async fn report_segment_stats(&self, stats: Vec<SegmentStatsUpdate>) -> NodeResult<()>;

  async fn report_time_tick(&self, channel: &str, ts: Timestamp) -> NodeResult<()>;
}

// records every outbound call; doubles as the wiring target until a real
// coordinator client is attached
pub struct RecordingCoordClient {
  pub saved: Mutex<Vec<SaveBinlogPathsRequest>>,
  pub stats: Mutex<Vec<SegmentStatsUpdate>>,
  pub ticks: Mutex<Vec<(String, Timestamp)>>,
}

impl RecordingCoordClient {
  pub fn new() -> Self {
    RecordingCoordClient {
      saved: Mutex::new(Vec::new()),
      stats: Mutex::new(Vec::new()),
      ticks: Mutex::new(Vec::new()),
    }
  }
}

#[async_trait]
impl DataCoordClient for RecordingCoordClient {
  async fn save_binlog_paths(&self, req: SaveBinlogPathsRequest) -> NodeResult<()> {
    self.saved.lock().await.push(req);
    Ok(())
  }

  async fn report_segment_stats(&self, stats: Vec<SegmentStatsUpdate>) -> NodeResult<()> {
    self.stats.lock().await.extend(stats);
    Ok(())
  }

  async fn report_time_tick(&self, channel: &str, ts: Timestamp) -> NodeResult<()> {
    self.ticks.lock().await.push((channel.to_string(), ts));
    Ok(())
  }
}
