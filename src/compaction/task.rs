use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;

use crate::codec::delete::{decode_delta_log, encode_delta_log, DeleteData};
use crate::codec::field_data::FieldData;
use crate::codec::insert::{decode_insert_binlog, encode_insert_binlog, BinlogDescriptor};
use crate::codec::stats::{encode_stats_log, PkStatistics};
use crate::constants::{DELTA_LOG_PREFIX, INSERT_LOG_PREFIX, STATS_LOG_PREFIX, TIMESTAMP_FIELD_ID};
use crate::errors::{Contextable, NodeError, NodeResult};
use crate::external::allocator::{IdAllocator, TsOracle};
use crate::external::object_store::ObjectStore;
use crate::flush::FlushManager;
use crate::msg::{
  CompactionPlan, CompactionResult, CompactionType, DelDataBuf, DeltaLogInfo, FieldBinlogPaths,
};
use crate::replica::Replica;
use crate::schema::CollectionSchema;
use crate::types::{physical_ts, FieldId, PkValue, SegmentId, Timestamp};
use crate::utils::retry_io;

// merges a plan's source segments into one fresh target segment, honoring the
// time-travel watermark and the entity TTL, while the flush manager redirects
// concurrent source flushes to the target
pub struct CompactionTask {
  pub plan: CompactionPlan,
  replica: Arc<Replica>,
  flush_mgr: Arc<FlushManager>,
  allocator: Arc<dyn IdAllocator>,
  oracle: Arc<dyn TsOracle>,
  store: Arc<dyn ObjectStore>,
  entity_ttl_seconds: i64,
  flush_insert_buffer_size: u64,
  io_retry_max_seconds: u64,
}

struct MergeAccumulator {
  fields: HashMap<FieldId, FieldData>,
  rows: usize,
}

impl CompactionTask {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    plan: CompactionPlan,
    replica: Arc<Replica>,
    flush_mgr: Arc<FlushManager>,
    allocator: Arc<dyn IdAllocator>,
    oracle: Arc<dyn TsOracle>,
    store: Arc<dyn ObjectStore>,
    entity_ttl_seconds: i64,
    flush_insert_buffer_size: u64,
    io_retry_max_seconds: u64,
  ) -> CompactionTask {
    CompactionTask {
      plan,
      replica,
      flush_mgr,
      allocator,
      oracle,
      store,
      entity_ttl_seconds,
      flush_insert_buffer_size,
      io_retry_max_seconds,
    }
  }

  fn validate(&self) -> NodeResult<()> {
    match self.plan.compaction_type {
      CompactionType::Merge | CompactionType::Mix => {}
      CompactionType::Undefined => {
        return Err(NodeError::invalid(format!(
          "plan {} has undefined compaction type",
          self.plan.plan_id,
        )))
      }
    }
    if self.plan.segment_binlogs.is_empty() {
      return Err(NodeError::invalid(format!(
        "plan {} names no source segments",
        self.plan.plan_id,
      )));
    }
    Ok(())
  }

  pub async fn execute(&self) -> NodeResult<CompactionResult> {
    self.validate()?;

    let target_segment_id = self.allocator.alloc_id().await?;
    let source_ids: Vec<SegmentId> = self
      .plan
      .segment_binlogs
      .iter()
      .map(|seg| seg.segment_id)
      .collect();
    log::info!(
      "plan {} compacting segments {:?} on channel {} into {}",
      self.plan.plan_id, source_ids, self.plan.channel, target_segment_id,
    );

    // barrier: once this resolves, every source queue has drained the items
    // enqueued before the plan started
    let mut injection = self
      .flush_mgr
      .inject_flush(target_segment_id, &source_ids)
      .await?;
    injection.injected().await?;

    // the first error of any step aborts the merge and releases the barrier
    // without rewriting, so normal source flushing resumes
    match self.merge(target_segment_id).await {
      Ok(result) => {
        injection.inject_done(true);
        log::info!(
          "plan {} finished; target segment {} holds {} rows",
          self.plan.plan_id, target_segment_id, result.num_rows,
        );
        Ok(result)
      }
      Err(e) => {
        injection.inject_done(false);
        Err(e.with_context(format!("while executing compaction plan {}", self.plan.plan_id)))
      }
    }
  }

  async fn merge(&self, target_segment_id: SegmentId) -> NodeResult<CompactionResult> {
    let schema = self.replica.collection_schema(0).await?;
    let pk_field_id = schema.pk_field()?.field_id;

    // all sources share one partition; resolve it off whichever the replica
    // still tracks
    let mut partition_id = 0;
    for source in &self.plan.segment_binlogs {
      if let Some((_, part)) = self.replica.segment_meta(source.segment_id).await {
        partition_id = part;
        break;
      }
    }

    let (visibility, mut out_delta) = self.merge_delta_logs().await?;

    let max_rows_per_binlog = schema.buffer_row_limit(self.flush_insert_buffer_size)?;
    let now = self.oracle.now().await?;

    let mut acc = MergeAccumulator {
      fields: schema
        .fields
        .iter()
        .map(|f| (f.field_id, FieldData::new(f.data_type)))
        .collect(),
      rows: 0,
    };
    let mut target_stats = PkStatistics::new(pk_field_id);
    let mut insert_paths: HashMap<FieldId, Vec<String>> = HashMap::new();
    let mut kept: i64 = 0;
    let mut deleted: u64 = 0;
    let mut expired: u64 = 0;

    for source in &self.plan.segment_binlogs {
      let n_batches = source
        .field_binlogs
        .iter()
        .map(|fb| fb.paths.len())
        .max()
        .unwrap_or(0);
      for batch in 0..n_batches {
        let columns = self.download_insert_batch(source.segment_id, source, batch).await?;
        if columns.is_empty() {
          continue;
        }
        let pk_column = columns.get(&pk_field_id).ok_or_else(|| {
          NodeError::assertion(format!(
            "segment {} batch {} carries no primary key column",
            source.segment_id, batch,
          ))
        })?;
        let rows = pk_column.len();
        let timestamps = columns.get(&TIMESTAMP_FIELD_ID);

        for row in 0..rows {
          let pk = pk_column.pk_at(row)?;
          let ts = row_timestamp(timestamps, row)?;

          if is_deleted_at_visibility(&visibility, &pk, ts, self.plan.time_travel_ts) {
            deleted += 1;
            continue;
          }
          if self.is_expired(ts, now) {
            expired += 1;
            continue;
          }

          for (field_id, column) in &columns {
            if let Some(dst) = acc.fields.get_mut(field_id) {
              dst.append_row(column, row)?;
            }
          }
          acc.rows += 1;
          target_stats.update(&pk);
          kept += 1;

          if acc.rows >= max_rows_per_binlog {
            self
              .upload_binlog_group(target_segment_id, partition_id, &mut acc, &schema, &mut insert_paths)
              .await?;
          }
        }
      }
    }
    if acc.rows > 0 {
      self
        .upload_binlog_group(target_segment_id, partition_id, &mut acc, &schema, &mut insert_paths)
        .await?;
    }

    let stats_logs = self
      .upload_stats(target_segment_id, partition_id, &target_stats)
      .await?;
    let delta_logs = self
      .upload_delta(target_segment_id, partition_id, &mut out_delta)
      .await?;

    log::info!(
      "plan {} merged {} rows ({} deleted at time travel, {} expired)",
      self.plan.plan_id, kept, deleted, expired,
    );

    Ok(CompactionResult {
      plan_id: self.plan.plan_id,
      target_segment_id,
      insert_logs: insert_paths
        .into_iter()
        .map(|(field_id, paths)| FieldBinlogPaths { field_id, paths })
        .collect(),
      stats_logs,
      delta_logs,
      num_rows: kept,
    })
  }

  // download every source segment's delta logs concurrently and split them
  // into the visibility map (absorbed at merge time) and the carried-forward
  // delta buffer
  async fn merge_delta_logs(
    &self,
  ) -> NodeResult<(HashMap<PkValue, Timestamp>, DelDataBuf)> {
    let downloads = self.plan.segment_binlogs.iter().map(|source| async move {
      let mut datas: Vec<DeleteData> = Vec::new();
      if !source.delta_logs.is_empty() {
        let blobs = self
          .store
          .multi_get(&source.delta_logs)
          .await
          .with_context(|| format!(
            "while downloading delta logs of segment {}",
            source.segment_id,
          ))?;
        for blob in blobs {
          datas.push(decode_delta_log(&blob)?);
        }
      }
      Ok::<_, NodeError>(datas)
    });
    // scoped error-group semantics: the first failure aborts them all
    let per_segment = try_join_all(downloads).await?;

    let mut visibility: HashMap<PkValue, Timestamp> = HashMap::new();
    let mut out = DelDataBuf::default();
    for datas in per_segment {
      for data in datas {
        for (pk, ts) in data.iter() {
          if self.plan.time_travel_ts > 0 && ts <= self.plan.time_travel_ts {
            let entry = visibility.entry(pk.clone()).or_insert(ts);
            if ts > *entry {
              *entry = ts;
            }
          } else {
            out.append(pk.clone(), ts);
          }
        }
      }
    }
    Ok((visibility, out))
  }

  async fn download_insert_batch(
    &self,
    segment_id: SegmentId,
    source: &crate::msg::SegmentBinlogs,
    batch: usize,
  ) -> NodeResult<HashMap<FieldId, FieldData>> {
    let downloads = source
      .field_binlogs
      .iter()
      .filter_map(|fb| fb.paths.get(batch).map(|path| (fb.field_id, path)))
      .map(|(field_id, path)| async move {
        let blob = self
          .store
          .get(path)
          .await
          .with_context(|| format!("while downloading binlog {}", path))?;
        let (desc, data) = decode_insert_binlog(&blob)?;
        if desc.field_id != field_id {
          return Err(NodeError::assertion(format!(
            "binlog {} descriptor names field {} but the plan says {}",
            path, desc.field_id, field_id,
          )));
        }
        Ok::<_, NodeError>((field_id, data))
      });
    let columns: HashMap<FieldId, FieldData> =
      try_join_all(downloads).await?.into_iter().collect();

    // all columns of one batch must cover the same rows
    let mut lens = columns.values().map(FieldData::len);
    if let Some(first) = lens.next() {
      if lens.any(|len| len != first) {
        return Err(NodeError::assertion(format!(
          "segment {} batch {} has ragged column lengths",
          segment_id, batch,
        )));
      }
    }
    Ok(columns)
  }

  fn is_expired(&self, ts: Timestamp, now: Timestamp) -> bool {
    if self.entity_ttl_seconds <= 0 {
      return false;
    }
    physical_ts(ts) + self.entity_ttl_seconds * 1000 < physical_ts(now)
  }

  async fn upload_binlog_group(
    &self,
    target_segment_id: SegmentId,
    partition_id: i64,
    acc: &mut MergeAccumulator,
    schema: &CollectionSchema,
    insert_paths: &mut HashMap<FieldId, Vec<String>>,
  ) -> NodeResult<()> {
    for field in &schema.fields {
      let data = match acc.fields.get(&field.field_id) {
        Some(data) if !data.is_empty() => data,
        _ => continue,
      };
      let desc = BinlogDescriptor {
        collection_id: self.plan.collection_id,
        partition_id,
        segment_id: target_segment_id,
        field_id: field.field_id,
        data_type: data.data_type(),
        row_count: data.len() as u64,
      };
      let bytes = encode_insert_binlog(&desc, data)?;
      let log_id = self.allocator.alloc_id().await?;
      let path = format!(
        "{}/{}/{}/{}/{}/{}",
        INSERT_LOG_PREFIX,
        self.plan.collection_id,
        partition_id,
        target_segment_id,
        field.field_id,
        log_id,
      );
      retry_io(self.io_retry_max_seconds, || self.store.put(&path, bytes.clone())).await?;
      insert_paths.entry(field.field_id).or_insert_with(Vec::new).push(path);
    }
    for data in acc.fields.values_mut() {
      *data = FieldData::new(data.data_type());
    }
    acc.rows = 0;
    Ok(())
  }

  async fn upload_stats(
    &self,
    target_segment_id: SegmentId,
    partition_id: i64,
    stats: &PkStatistics,
  ) -> NodeResult<Vec<FieldBinlogPaths>> {
    let bytes = encode_stats_log(stats)?;
    let log_id = self.allocator.alloc_id().await?;
    let path = format!(
      "{}/{}/{}/{}/{}/{}",
      STATS_LOG_PREFIX,
      self.plan.collection_id,
      partition_id,
      target_segment_id,
      stats.field_id,
      log_id,
    );
    retry_io(self.io_retry_max_seconds, || self.store.put(&path, bytes.clone())).await?;
    Ok(vec![FieldBinlogPaths {
      field_id: stats.field_id,
      paths: vec![path],
    }])
  }

  // deletions newer than the watermark travel with the target segment
  async fn upload_delta(
    &self,
    target_segment_id: SegmentId,
    partition_id: i64,
    out_delta: &mut DelDataBuf,
  ) -> NodeResult<Vec<DeltaLogInfo>> {
    if out_delta.entries() == 0 {
      return Ok(Vec::new());
    }
    let bytes = encode_delta_log(&out_delta.data)?;
    let size = bytes.len() as u64;
    let log_id = self.allocator.alloc_id().await?;
    let path = format!(
      "{}/{}/{}/{}/{}",
      DELTA_LOG_PREFIX,
      self.plan.collection_id,
      partition_id,
      target_segment_id,
      log_id,
    );
    retry_io(self.io_retry_max_seconds, || self.store.put(&path, bytes.clone())).await?;
    Ok(vec![DeltaLogInfo {
      path,
      size,
      ts_from: out_delta.ts_from,
      ts_to: out_delta.ts_to,
      entries: out_delta.entries() as u64,
    }])
  }
}

fn row_timestamp(timestamps: Option<&FieldData>, row: usize) -> NodeResult<Timestamp> {
  match timestamps {
    Some(FieldData::Int64(v)) => Ok(v[row] as Timestamp),
    _ => Err(NodeError::assertion(
      "source binlogs carry no timestamp column",
    )),
  }
}

// a row is invisible when its key was deleted at or before the watermark and
// the row itself is not newer than the watermark
fn is_deleted_at_visibility(
  visibility: &HashMap<PkValue, Timestamp>,
  pk: &PkValue,
  ts: Timestamp,
  time_travel_ts: Timestamp,
) -> bool {
  visibility.contains_key(pk) && ts <= time_travel_ts
}
