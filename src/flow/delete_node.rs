use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{NodeError, NodeResult};
use crate::flush::FlushManager;
use crate::msg::{DelDataBuf, FlowGraphMsg};
use crate::replica::Replica;
use crate::types::SegmentId;

// stages delete data keyed by segment until the owning segment flushes, then
// hands the staged batch to the flush manager as a delta log
pub struct DeleteNode {
  channel: String,
  replica: Arc<Replica>,
  flush_mgr: Arc<FlushManager>,
  staged: HashMap<SegmentId, DelDataBuf>,
}

impl DeleteNode {
  pub fn new(
    channel: impl Into<String>,
    replica: Arc<Replica>,
    flush_mgr: Arc<FlushManager>,
  ) -> DeleteNode {
    DeleteNode {
      channel: channel.into(),
      replica,
      flush_mgr,
      staged: HashMap::new(),
    }
  }

  pub async fn operate(&mut self, msg: FlowGraphMsg) -> NodeResult<FlowGraphMsg> {
    if msg.drop_collection {
      self.staged.clear();
      return Ok(msg);
    }

    for delete in &msg.delete_msgs {
      if delete.pks.len() != delete.timestamps.len() {
        log::error!(
          "channel {} dropping misaligned delete message: {} pks vs {} timestamps",
          self.channel,
          delete.pks.len(),
          delete.timestamps.len(),
        );
        continue;
      }
      for (pk, &ts) in delete.pks.iter().zip(delete.timestamps.iter()) {
        // the bloom filters give a conservative candidate set; a false
        // positive only costs a spurious (pk, ts) tuple in a delta log
        for segment_id in self.replica.filter_segments_by_pk(pk).await {
          self.staged
            .entry(segment_id)
            .or_insert_with(DelDataBuf::default)
            .append(pk.clone(), ts);
        }
      }
    }

    if !msg.segments_to_flush.is_empty() {
      let pos = msg
        .end_positions
        .last()
        .cloned()
        .ok_or_else(|| NodeError::invalid(format!(
          "channel {} flush tick carries no end position",
          self.channel,
        )))?;
      for &segment_id in &msg.segments_to_flush {
        if let Some(buf) = self.staged.remove(&segment_id) {
          log::info!(
            "channel {} flushing {} staged deletes for segment {}",
            self.channel,
            buf.entries(),
            segment_id,
          );
          if let Err(e) = self
            .flush_mgr
            .flush_del_data(buf, segment_id, pos.clone())
            .await
          {
            log::error!(
              "channel {} failed to submit delta flush for segment {}: {}",
              self.channel, segment_id, e,
            );
          }
        }
      }
    }

    Ok(msg)
  }
}
