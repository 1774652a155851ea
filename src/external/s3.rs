use std::str::FromStr;

use async_trait::async_trait;
use aws_config::ConfigLoader;
use aws_sdk_s3::types::ByteStream;
use aws_sdk_s3::{Client, Credentials, Endpoint, Region};
use http::Uri;
use tokio::sync::RwLock;

use crate::errors::{Contextable, NodeError, NodeResult};
use crate::external::object_store::ObjectStore;
use crate::opt::CloudOpt;

pub struct S3ObjectStore {
  opts: CloudOpt,
  bucket: String,
  client: RwLock<Option<Client>>,
}

impl S3ObjectStore {
  pub fn new(opts: CloudOpt) -> NodeResult<Self> {
    let bucket = opts
      .s3_bucket
      .clone()
      .ok_or_else(|| NodeError::invalid("s3 object store requires a bucket"))?;
    Ok(S3ObjectStore {
      opts,
      bucket,
      client: RwLock::new(None),
    })
  }

  async fn client(&self) -> NodeResult<Client> {
    {
      let maybe_client = &*self.client.read().await;
      if let Some(client) = maybe_client {
        return Ok(client.clone());
      }
    }

    let mut maybe_client = self.client.write().await;
    if maybe_client.is_none() {
      let mut config_loader = ConfigLoader::default();
      if let (Some(access_key), Some(secret_key)) =
        (&self.opts.s3_access_key, &self.opts.s3_secret_key)
      {
        config_loader = config_loader.credentials_provider(Credentials::new(
          access_key.clone(),
          secret_key.clone(),
          None,
          None,
          "SiltDB S3",
        ));
      }
      if let Some(endpoint) = &self.opts.s3_endpoint {
        let uri = Uri::from_str(endpoint)
          .map_err(|e| NodeError::from(e).with_context("while creating S3 client"))?;
        config_loader = config_loader.endpoint_resolver(Endpoint::immutable(uri));
      }
      if let Some(region) = &self.opts.s3_region {
        config_loader = config_loader.region(Region::new(region.to_string()));
      }
      let config = config_loader.load().await;
      *maybe_client = Some(Client::new(&config));
    }

    Ok(maybe_client.clone().unwrap())
  }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
  async fn put(&self, path: &str, bytes: Vec<u8>) -> NodeResult<()> {
    let client = self.client().await?;
    client
      .put_object()
      .bucket(self.bucket.clone())
      .key(path)
      .body(ByteStream::from(bytes))
      .send()
      .await
      .map_err(|e| NodeError::transient_io(format!("put object failed: {:?}", e)))?;
    Ok(())
  }

  async fn get(&self, path: &str) -> NodeResult<Vec<u8>> {
    let client = self.client().await?;
    let resp = client
      .get_object()
      .bucket(self.bucket.clone())
      .key(path)
      .send()
      .await
      .map_err(|e| NodeError::transient_io(format!("get object failed: {:?}", e)))?;
    let bytes = resp
      .body
      .collect()
      .await
      .map_err(|e| NodeError::transient_io(format!("get object body failed: {:?}", e)))
      .with_context(|| format!("while downloading {}", path))?;
    Ok(bytes.into_bytes().to_vec())
  }
}
