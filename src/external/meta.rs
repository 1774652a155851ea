use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::{NodeError, NodeResult};
use crate::schema::CollectionSchema;
use crate::types::{CollectionId, PartitionId, SegmentId, Timestamp};

// remote schema metadata service; implementations may cache, callers treat
// every call as slow
#[async_trait]
pub trait SchemaService: Send + Sync {
  // ts = 0 means latest
  async fn collection_schema(
    &self,
    collection_id: CollectionId,
    ts: Timestamp,
  ) -> NodeResult<CollectionSchema>;

  async fn collection_and_partition(
    &self,
    segment_id: SegmentId,
  ) -> NodeResult<(CollectionId, PartitionId)>;
}

// process-local registry; the production node swaps in an RPC-backed client
pub struct StaticSchemaService {
  schemas: RwLock<HashMap<CollectionId, CollectionSchema>>,
  segments: RwLock<HashMap<SegmentId, (CollectionId, PartitionId)>>,
}

impl StaticSchemaService {
  pub fn new() -> Self {
    StaticSchemaService {
      schemas: RwLock::new(HashMap::new()),
      segments: RwLock::new(HashMap::new()),
    }
  }

  pub async fn register_collection(&self, collection_id: CollectionId, schema: CollectionSchema) {
    self.schemas.write().await.insert(collection_id, schema);
  }

  pub async fn register_segment(
    &self,
    segment_id: SegmentId,
    collection_id: CollectionId,
    partition_id: PartitionId,
  ) {
    self.segments
      .write()
      .await
      .insert(segment_id, (collection_id, partition_id));
  }
}

#[async_trait]
impl SchemaService for StaticSchemaService {
  async fn collection_schema(
    &self,
    collection_id: CollectionId,
    _ts: Timestamp,
  ) -> NodeResult<CollectionSchema> {
    self.schemas
      .read()
      .await
      .get(&collection_id)
      .cloned()
      .ok_or_else(|| NodeError::does_not_exist("collection schema", collection_id))
  }

  async fn collection_and_partition(
    &self,
    segment_id: SegmentId,
  ) -> NodeResult<(CollectionId, PartitionId)> {
    self.segments
      .read()
      .await
      .get(&segment_id)
      .copied()
      .ok_or_else(|| NodeError::does_not_exist("segment", segment_id))
  }
}
