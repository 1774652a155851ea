use std::str::FromStr;

use log::LevelFilter;
use structopt::StructOpt;

use crate::errors::{NodeError, NodeResult};

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "SiltDB Data Node")]
pub struct Opt {
  #[structopt(long, default_value = "localhost:13333")]
  pub coordinator_endpoint: String,

  #[structopt(long, default_value = "localhost:6650")]
  pub msg_bus_endpoint: String,

  #[structopt(long, default_value = "INFO")]
  pub log_level: LevelFilter,

  #[structopt(flatten)]
  pub cloud_opts: CloudOpt,

  // an insert buffer auto-flushes once the rows it holds would exceed this
  // many uncompressed bytes of vector data
  #[structopt(long, default_value = "16777216")]
  pub flush_insert_buffer_size: u64,

  // bound on every flow-graph edge; producers block when a downstream node
  // falls behind
  #[structopt(long, default_value = "1024")]
  pub flow_graph_queue_len: usize,

  // worker bound for the shared compaction executor
  #[structopt(long, default_value = "2")]
  pub compaction_parallelism: usize,

  // entities older than this are dropped during compaction; 0 disables
  // expiration entirely
  #[structopt(long, default_value = "0")]
  pub entity_ttl_seconds: i64,

  // the merged time-tick sender emits at most one tick per interval
  #[structopt(long, default_value = "200")]
  pub sync_interval_millis: u64,

  // cap on the exponential-backoff window for object-store uploads and
  // delta-stream produces; once exhausted the owning flow graph is torn down
  #[structopt(long, default_value = "10")]
  pub io_retry_max_seconds: u64,
}

#[derive(Clone, Copy, Debug, StructOpt)]
pub enum ObjectStoreProvider {
  Memory,
  S3,
}

#[derive(Clone, Debug, StructOpt)]
pub struct CloudOpt {
  #[structopt(long, default_value = "MEMORY")]
  pub object_store: ObjectStoreProvider,

  #[structopt(long)]
  pub s3_bucket: Option<String>,

  #[structopt(long)]
  pub s3_endpoint: Option<String>,

  #[structopt(long)]
  pub s3_region: Option<String>,

  #[structopt(long)]
  pub s3_access_key: Option<String>,

  #[structopt(long)]
  pub s3_secret_key: Option<String>,
}

impl FromStr for ObjectStoreProvider {
  type Err = NodeError;

  fn from_str(s: &str) -> NodeResult<Self> {
    match s.to_lowercase().as_str() {
      "memory" => Ok(ObjectStoreProvider::Memory),
      "s3" => Ok(ObjectStoreProvider::S3),
      invalid => Err(NodeError::invalid(format!(
        "invalid object store provider {}",
        invalid,
      ))),
    }
  }
}

impl Opt {
  pub fn validate(&self) {
    if self.flush_insert_buffer_size == 0 {
      panic!("flush insert buffer size must be positive");
    }
    if self.flow_graph_queue_len == 0 {
      panic!("flow graph queue length must be positive");
    }
    if let ObjectStoreProvider::S3 = self.cloud_opts.object_store {
      if self.cloud_opts.s3_bucket.is_none() {
        panic!("s3 object store requires --s3-bucket");
      }
    }
  }
}
