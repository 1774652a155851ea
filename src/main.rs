#![allow(clippy::new_without_default)]

use std::sync::Arc;

use structopt::StructOpt;

use crate::errors::{Contextable, NodeResult};
use crate::external::allocator::{LocalIdAllocator, LocalTsOracle};
use crate::external::data_coord::RecordingCoordClient;
use crate::external::meta::StaticSchemaService;
use crate::external::msg_stream::MemoryBus;
use crate::external::object_store::{MemoryObjectStore, ObjectStore};
use crate::external::s3::S3ObjectStore;
use crate::logging::Logger;
use crate::node::DataNode;
use crate::opt::{ObjectStoreProvider, Opt};

mod buffer;
mod codec;
mod compaction;
mod constants;
mod errors;
mod external;
mod flow;
mod flush;
mod logging;
mod msg;
mod node;
mod opt;
mod replica;
mod schema;
mod types;
mod utils;
mod watch;

static LOGGER: Logger = Logger;

#[tokio::main]
async fn main() -> NodeResult<()> {
  let opts: Opt = Opt::from_args();
  opts.validate();
  log::set_max_level(opts.log_level);
  log::set_logger(&LOGGER)
    .expect("unable to initialize logging");

  let store: Arc<dyn ObjectStore> = match opts.cloud_opts.object_store {
    ObjectStoreProvider::Memory => Arc::new(MemoryObjectStore::new()),
    ObjectStoreProvider::S3 => Arc::new(S3ObjectStore::new(opts.cloud_opts.clone())?),
  };
  let bus = MemoryBus::new(opts.flow_graph_queue_len);
  log::info!(
    "configured for coordinator {} and message bus {}",
    opts.coordinator_endpoint,
    opts.msg_bus_endpoint,
  );

  let node = DataNode::new(
    &opts,
    Arc::new(StaticSchemaService::new()),
    store,
    Arc::new(LocalIdAllocator::new(1)),
    Arc::new(LocalTsOracle::new()),
    Box::new(bus),
    Arc::new(RecordingCoordClient::new()),
  );
  node.init()
    .await
    .with_context(|| "while initializing the data node")?;
  log::info!("ready to watch channels");

  tokio::signal::ctrl_c()
    .await
    .expect("unable to listen for shutdown signal");
  node.stop().await;
  Ok(())
}
