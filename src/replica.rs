use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::codec::stats::{decode_stats_log, PkStatistics};
use crate::errors::{Contextable, NodeError, NodeResult};
use crate::external::meta::SchemaService;
use crate::external::object_store::ObjectStore;
use crate::schema::CollectionSchema;
use crate::types::{
  CollectionId, PartitionId, PkValue, SegmentId, SegmentState, StreamPosition, Timestamp,
};

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentCheckpoint {
  pub num_rows: i64,
  pub position: StreamPosition,
}

pub struct Segment {
  pub id: SegmentId,
  pub collection_id: CollectionId,
  pub partition_id: PartitionId,
  pub channel: String,
  pub state: SegmentState,
  pub num_rows: i64,
  pub start_pos: StreamPosition,
  pub end_pos: StreamPosition,
  pub checkpoint: SegmentCheckpoint,
  pub pk_stats: PkStatistics,
}

#[derive(Default)]
struct Bins {
  new: HashMap<SegmentId, Segment>,
  growing: HashMap<SegmentId, Segment>,
  flushed: HashMap<SegmentId, Segment>,
}

impl Bins {
  fn find(&self, id: SegmentId) -> Option<&Segment> {
    self.new
      .get(&id)
      .or_else(|| self.growing.get(&id))
      .or_else(|| self.flushed.get(&id))
  }

  fn find_unflushed_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
    if self.new.contains_key(&id) {
      return self.new.get_mut(&id);
    }
    self.growing.get_mut(&id)
  }

  fn contains(&self, id: SegmentId) -> bool {
    self.new.contains_key(&id) || self.growing.contains_key(&id) || self.flushed.contains_key(&id)
  }
}

// single source of truth for the segments of one collection on one channel;
// one reader/writer lock over the three bins, bin transitions hold the write
// lock for the whole move
pub struct Replica {
  collection_id: CollectionId,
  channel: String,
  schema_service: Arc<dyn SchemaService>,
  store: Arc<dyn ObjectStore>,
  bins: RwLock<Bins>,
}

impl Replica {
  pub fn new(
    collection_id: CollectionId,
    channel: impl Into<String>,
    schema_service: Arc<dyn SchemaService>,
    store: Arc<dyn ObjectStore>,
  ) -> Replica {
    Replica {
      collection_id,
      channel: channel.into(),
      schema_service,
      store,
      bins: RwLock::new(Bins::default()),
    }
  }

  pub fn collection_id(&self) -> CollectionId {
    self.collection_id
  }

  pub fn channel(&self) -> &str {
    &self.channel
  }

  pub async fn collection_schema(&self, ts: Timestamp) -> NodeResult<CollectionSchema> {
    self.schema_service
      .collection_schema(self.collection_id, ts)
      .await
      .with_context(|| format!("while resolving schema for collection {}", self.collection_id))
  }

  fn check_collection(&self, collection_id: CollectionId) -> NodeResult<()> {
    if collection_id != self.collection_id {
      return Err(NodeError::invalid(format!(
        "segment belongs to collection {} but replica owns collection {}",
        collection_id, self.collection_id,
      )));
    }
    Ok(())
  }

  async fn load_pk_stats(&self, stats_log_paths: &[String]) -> NodeResult<PkStatistics> {
    let schema = self.collection_schema(0).await?;
    let pk_field_id = schema.pk_field()?.field_id;
    let mut stats = PkStatistics::new(pk_field_id);
    for path in stats_log_paths {
      let bytes = self
        .store
        .get(path)
        .await
        .with_context(|| format!("while loading stats log {}", path))?;
      let loaded = decode_stats_log(&bytes)
        .with_context(|| format!("while deserializing stats log {}", path))?;
      stats.merge(&loaded)?;
    }
    Ok(stats)
  }

  pub async fn add_new_segment(
    &self,
    id: SegmentId,
    collection_id: CollectionId,
    partition_id: PartitionId,
    channel: &str,
    start_pos: StreamPosition,
    end_pos: StreamPosition,
  ) -> NodeResult<()> {
    self.check_collection(collection_id)?;
    let schema = self.collection_schema(0).await?;
    let pk_field_id = schema.pk_field()?.field_id;

    let mut bins = self.bins.write().await;
    if bins.contains(id) {
      return Err(NodeError::invalid(format!("segment {} already exists", id)));
    }
    log::info!(
      "channel {} adding new segment {} (collection {} partition {})",
      self.channel, id, collection_id, partition_id,
    );
    bins.new.insert(id, Segment {
      id,
      collection_id,
      partition_id,
      channel: channel.to_string(),
      state: SegmentState::New,
      num_rows: 0,
      start_pos: start_pos.clone(),
      end_pos,
      checkpoint: SegmentCheckpoint {
        num_rows: 0,
        position: start_pos,
      },
      pk_stats: PkStatistics::new(pk_field_id),
    });
    Ok(())
  }

  // materialize a growing segment recovered from persisted state; its bloom
  // filter is the union of the stats blobs written so far
  pub async fn add_normal_segment(
    &self,
    id: SegmentId,
    collection_id: CollectionId,
    partition_id: PartitionId,
    channel: &str,
    num_rows: i64,
    stats_log_paths: &[String],
    checkpoint: SegmentCheckpoint,
  ) -> NodeResult<()> {
    self.check_collection(collection_id)?;
    let pk_stats = self.load_pk_stats(stats_log_paths).await?;

    let mut bins = self.bins.write().await;
    if bins.contains(id) {
      return Err(NodeError::invalid(format!("segment {} already exists", id)));
    }
    log::info!(
      "channel {} adding growing segment {} with {} rows",
      self.channel, id, num_rows,
    );
    bins.growing.insert(id, Segment {
      id,
      collection_id,
      partition_id,
      channel: channel.to_string(),
      state: SegmentState::Growing,
      num_rows,
      start_pos: checkpoint.position.clone(),
      end_pos: checkpoint.position.clone(),
      checkpoint,
      pk_stats,
    });
    Ok(())
  }

  pub async fn add_flushed_segment(
    &self,
    id: SegmentId,
    collection_id: CollectionId,
    partition_id: PartitionId,
    channel: &str,
    num_rows: i64,
    stats_log_paths: &[String],
  ) -> NodeResult<()> {
    self.check_collection(collection_id)?;
    let pk_stats = self.load_pk_stats(stats_log_paths).await?;

    let mut bins = self.bins.write().await;
    if bins.contains(id) {
      return Err(NodeError::invalid(format!("segment {} already exists", id)));
    }
    let pos = StreamPosition::new(channel, Vec::new(), 0);
    bins.flushed.insert(id, Segment {
      id,
      collection_id,
      partition_id,
      channel: channel.to_string(),
      state: SegmentState::Flushed,
      num_rows,
      start_pos: pos.clone(),
      end_pos: pos.clone(),
      checkpoint: SegmentCheckpoint {
        num_rows,
        position: pos,
      },
      pk_stats,
    });
    Ok(())
  }

  // New|Growing -> Flushed; no-op when the segment is unknown
  pub async fn segment_flushed(&self, id: SegmentId) {
    let mut bins = self.bins.write().await;
    let seg = bins.new.remove(&id).or_else(|| bins.growing.remove(&id));
    match seg {
      Some(mut seg) => {
        seg.state = SegmentState::Flushed;
        bins.flushed.insert(id, seg);
        log::info!("channel {} segment {} transitioned to flushed", self.channel, id);
      }
      None => {
        if !bins.flushed.contains_key(&id) {
          log::warn!(
            "channel {} asked to flush unknown segment {}",
            self.channel, id,
          );
        }
      }
    }
  }

  // report each new segment's start position at most once by promoting the
  // segment to growing in the same critical section
  pub async fn list_new_segments_start_positions(&self) -> Vec<(SegmentId, StreamPosition)> {
    let mut bins = self.bins.write().await;
    let ids: Vec<SegmentId> = bins.new.keys().copied().collect();
    let mut res = Vec::with_capacity(ids.len());
    for id in ids {
      if let Some(mut seg) = bins.new.remove(&id) {
        res.push((id, seg.start_pos.clone()));
        seg.state = SegmentState::Growing;
        bins.growing.insert(id, seg);
      }
    }
    res
  }

  // checkpoints of new and growing segments only; flushed segments are the
  // coordinator's problem already
  pub async fn list_segments_checkpoints(&self) -> Vec<(SegmentId, SegmentCheckpoint)> {
    let bins = self.bins.read().await;
    bins.new
      .values()
      .chain(bins.growing.values())
      .map(|seg| (seg.id, seg.checkpoint.clone()))
      .collect()
  }

  pub async fn update_segment_end_position(&self, id: SegmentId, pos: &StreamPosition) {
    let mut bins = self.bins.write().await;
    match bins.find_unflushed_mut(id) {
      Some(seg) => seg.end_pos = pos.clone(),
      None => log::warn!(
        "channel {} cannot update end position of unknown segment {}",
        self.channel, id,
      ),
    }
  }

  pub async fn update_segment_pk_range(&self, id: SegmentId, pks: &[PkValue]) {
    let mut bins = self.bins.write().await;
    match bins.find_unflushed_mut(id) {
      Some(seg) => seg.pk_stats.update_batch(pks),
      None => log::warn!(
        "channel {} cannot update pk range of unknown segment {}",
        self.channel, id,
      ),
    }
  }

  // rebuild a flushed segment's pk index from scratch, then apply the batch
  pub async fn refresh_flushed_segment_pk_range(&self, id: SegmentId, pks: &[PkValue]) {
    let mut bins = self.bins.write().await;
    match bins.flushed.get_mut(&id) {
      Some(seg) => {
        let field_id = seg.pk_stats.field_id;
        seg.pk_stats = PkStatistics::new(field_id);
        seg.pk_stats.update_batch(pks);
      }
      None => log::warn!(
        "channel {} cannot refresh pk range of non-flushed segment {}",
        self.channel, id,
      ),
    }
  }

  pub async fn update_statistics(&self, id: SegmentId, delta: i64) -> NodeResult<()> {
    let mut bins = self.bins.write().await;
    match bins.find_unflushed_mut(id) {
      Some(seg) => {
        seg.num_rows += delta;
        Ok(())
      }
      None => Err(NodeError::does_not_exist("unflushed segment", id)),
    }
  }

  // snapshot (num_rows, end position) into the checkpoint
  pub async fn update_segment_checkpoint(&self, id: SegmentId) {
    let mut bins = self.bins.write().await;
    match bins.find_unflushed_mut(id) {
      Some(seg) => {
        seg.checkpoint = SegmentCheckpoint {
          num_rows: seg.num_rows,
          position: seg.end_pos.clone(),
        };
      }
      None => log::warn!(
        "channel {} cannot checkpoint unknown segment {}",
        self.channel, id,
      ),
    }
  }

  pub async fn has_segment(&self, id: SegmentId, count_flushed: bool) -> bool {
    let bins = self.bins.read().await;
    bins.new.contains_key(&id)
      || bins.growing.contains_key(&id)
      || (count_flushed && bins.flushed.contains_key(&id))
  }

  pub async fn segment_state(&self, id: SegmentId) -> Option<SegmentState> {
    self.bins.read().await.find(id).map(|seg| seg.state)
  }

  pub async fn segment_num_rows(&self, id: SegmentId) -> Option<i64> {
    self.bins.read().await.find(id).map(|seg| seg.num_rows)
  }

  pub async fn segment_meta(&self, id: SegmentId) -> Option<(CollectionId, PartitionId)> {
    self.bins
      .read()
      .await
      .find(id)
      .map(|seg| (seg.collection_id, seg.partition_id))
  }

  pub async fn segment_pk_stats(&self, id: SegmentId) -> NodeResult<PkStatistics> {
    self.bins
      .read()
      .await
      .find(id)
      .map(|seg| seg.pk_stats.clone())
      .ok_or_else(|| NodeError::does_not_exist("segment", id))
  }

  pub async fn filter_segments(
    &self,
    channel: &str,
    partition_id: Option<PartitionId>,
  ) -> Vec<SegmentId> {
    let bins = self.bins.read().await;
    bins.new
      .values()
      .chain(bins.growing.values())
      .chain(bins.flushed.values())
      .filter(|seg| seg.channel == channel)
      .filter(|seg| partition_id.map_or(true, |p| seg.partition_id == p))
      .map(|seg| seg.id)
      .collect()
  }

  // candidate segments whose bloom filter admits the key; conservative, may
  // include false positives, never misses a segment that holds the key
  pub async fn filter_segments_by_pk(&self, pk: &PkValue) -> Vec<SegmentId> {
    let bins = self.bins.read().await;
    bins.new
      .values()
      .chain(bins.growing.values())
      .chain(bins.flushed.values())
      .filter(|seg| seg.pk_stats.filter.contains(pk))
      .map(|seg| seg.id)
      .collect()
  }

  pub async fn remove_segment(&self, id: SegmentId) {
    let mut bins = self.bins.write().await;
    bins.new.remove(&id);
    bins.growing.remove(&id);
    bins.flushed.remove(&id);
  }

  // every segment id must live in exactly one bin; used by tests and debug
  // assertions around transitions
  pub async fn check_bins_disjoint(&self) -> NodeResult<()> {
    let bins = self.bins.read().await;
    for id in bins.new.keys() {
      if bins.growing.contains_key(id) || bins.flushed.contains_key(id) {
        return Err(NodeError::assertion(format!("segment {} is in two bins", id)));
      }
    }
    for id in bins.growing.keys() {
      if bins.flushed.contains_key(id) {
        return Err(NodeError::assertion(format!("segment {} is in two bins", id)));
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::tests::test_schema;
  use crate::external::meta::StaticSchemaService;
  use crate::external::object_store::MemoryObjectStore;

  async fn test_replica() -> Replica {
    let schema_service = Arc::new(StaticSchemaService::new());
    schema_service.register_collection(1, test_schema(4)).await;
    Replica::new(
      1,
      "ch-1",
      schema_service,
      Arc::new(MemoryObjectStore::new()),
    )
  }

  fn pos(ts: Timestamp) -> StreamPosition {
    StreamPosition::new("ch-1", ts.to_le_bytes().to_vec(), ts)
  }

  #[tokio::test]
  async fn test_new_segment_lifecycle() {
    let replica = test_replica().await;
    replica
      .add_new_segment(5, 1, 10, "ch-1", pos(1), pos(1))
      .await
      .unwrap();
    assert_eq!(replica.segment_state(5).await, Some(SegmentState::New));

    // start positions report once, transitioning the segment to growing
    let starts = replica.list_new_segments_start_positions().await;
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].0, 5);
    assert_eq!(replica.segment_state(5).await, Some(SegmentState::Growing));
    assert!(replica.list_new_segments_start_positions().await.is_empty());

    replica.segment_flushed(5).await;
    assert_eq!(replica.segment_state(5).await, Some(SegmentState::Flushed));
    replica.check_bins_disjoint().await.unwrap();

    // flushed segments never appear in checkpoint listings
    assert!(replica.list_segments_checkpoints().await.is_empty());
  }

  #[tokio::test]
  async fn test_collection_mismatch_rejected() {
    let replica = test_replica().await;
    let res = replica.add_new_segment(5, 2, 10, "ch-1", pos(1), pos(1)).await;
    assert!(res.is_err());
  }

  #[tokio::test]
  async fn test_statistics_and_checkpoint() {
    let replica = test_replica().await;
    replica
      .add_new_segment(5, 1, 10, "ch-1", pos(1), pos(1))
      .await
      .unwrap();
    replica.update_statistics(5, 42).await.unwrap();
    replica.update_segment_end_position(5, &pos(9)).await;
    replica.update_segment_checkpoint(5).await;

    let checkpoints = replica.list_segments_checkpoints().await;
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].1.num_rows, 42);
    assert_eq!(checkpoints[0].1.position, pos(9));

    // flushed segments reject statistics updates
    replica.segment_flushed(5).await;
    assert!(replica.update_statistics(5, 1).await.is_err());
  }

  #[tokio::test]
  async fn test_pk_range_tracked() {
    let replica = test_replica().await;
    replica
      .add_new_segment(5, 1, 10, "ch-1", pos(1), pos(1))
      .await
      .unwrap();
    replica
      .update_segment_pk_range(5, &[PkValue::Int(7), PkValue::Int(3)])
      .await;

    let stats = replica.segment_pk_stats(5).await.unwrap();
    assert_eq!(stats.min, Some(PkValue::Int(3)));
    assert_eq!(stats.max, Some(PkValue::Int(7)));
    assert!(stats.filter.contains(&PkValue::Int(7)));

    assert_eq!(replica.filter_segments_by_pk(&PkValue::Int(3)).await, vec![5]);
  }

  #[tokio::test]
  async fn test_add_normal_segment_merges_persisted_stats() {
    use crate::codec::stats::{encode_stats_log, PkStatistics};

    let schema_service = Arc::new(StaticSchemaService::new());
    schema_service.register_collection(1, test_schema(4)).await;
    let store = Arc::new(MemoryObjectStore::new());

    let mut stats_a = PkStatistics::new(100);
    stats_a.update(&PkValue::Int(1));
    let mut stats_b = PkStatistics::new(100);
    stats_b.update(&PkValue::Int(99));
    store.put("stats/a", encode_stats_log(&stats_a).unwrap()).await.unwrap();
    store.put("stats/b", encode_stats_log(&stats_b).unwrap()).await.unwrap();

    let replica = Replica::new(1, "ch-1", schema_service, store);
    replica
      .add_normal_segment(
        7,
        1,
        10,
        "ch-1",
        100,
        &["stats/a".to_string(), "stats/b".to_string()],
        SegmentCheckpoint { num_rows: 100, position: pos(50) },
      )
      .await
      .unwrap();

    assert_eq!(replica.segment_state(7).await, Some(SegmentState::Growing));
    let stats = replica.segment_pk_stats(7).await.unwrap();
    assert!(stats.filter.contains(&PkValue::Int(1)));
    assert!(stats.filter.contains(&PkValue::Int(99)));
    assert_eq!(stats.min, Some(PkValue::Int(1)));
    assert_eq!(stats.max, Some(PkValue::Int(99)));
  }

  #[tokio::test]
  async fn test_filter_and_remove_segments() {
    let replica = test_replica().await;
    replica.add_new_segment(5, 1, 10, "ch-1", pos(1), pos(1)).await.unwrap();
    replica.add_new_segment(6, 1, 20, "ch-1", pos(1), pos(1)).await.unwrap();

    let mut all = replica.filter_segments("ch-1", None).await;
    all.sort_unstable();
    assert_eq!(all, vec![5, 6]);
    assert_eq!(replica.filter_segments("ch-1", Some(20)).await, vec![6]);
    assert!(replica.filter_segments("ch-2", None).await.is_empty());

    replica.remove_segment(5).await;
    assert!(!replica.has_segment(5, true).await);
    assert_eq!(replica.filter_segments("ch-1", None).await, vec![6]);
  }

  #[tokio::test]
  async fn test_refresh_flushed_segment_rebuilds_filter() {
    let replica = test_replica().await;
    replica.add_new_segment(5, 1, 10, "ch-1", pos(1), pos(1)).await.unwrap();
    replica
      .update_segment_pk_range(5, &[PkValue::Int(1), PkValue::Int(2)])
      .await;
    replica.segment_flushed(5).await;

    // refresh drops the old membership before applying the new batch
    replica
      .refresh_flushed_segment_pk_range(5, &[PkValue::Int(100)])
      .await;
    let stats = replica.segment_pk_stats(5).await.unwrap();
    assert!(stats.filter.contains(&PkValue::Int(100)));
    // the old range is gone entirely
    assert_eq!(stats.min, Some(PkValue::Int(100)));
    assert_eq!(stats.max, Some(PkValue::Int(100)));
  }

  #[tokio::test]
  async fn test_add_normal_segment_fails_on_missing_stats() {
    let replica = test_replica().await;
    let res = replica
      .add_normal_segment(
        7,
        1,
        10,
        "ch-1",
        100,
        &["stats/missing".to_string()],
        SegmentCheckpoint { num_rows: 100, position: pos(50) },
      )
      .await;
    assert!(res.is_err());
  }
}
