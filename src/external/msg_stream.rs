use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::errors::{NodeError, NodeResult};
use crate::msg::MsgPack;
use crate::types::StreamPosition;

// message-bus seams; the real bus lives outside the node
#[async_trait]
pub trait MsgProducer: Send + Sync {
  async fn produce(&self, pack: MsgPack) -> NodeResult<()>;
}

#[async_trait]
pub trait MsgConsumer: Send {
  // None once the topic is closed
  async fn consume(&mut self) -> NodeResult<Option<MsgPack>>;

  async fn seek(&mut self, position: &StreamPosition) -> NodeResult<()>;
}

#[async_trait]
pub trait MsgBus: Send + Sync {
  async fn as_producer(&self, topic: &str) -> NodeResult<Box<dyn MsgProducer>>;

  async fn as_consumer(
    &self,
    topic: &str,
    subscription: &str,
  ) -> NodeResult<Box<dyn MsgConsumer>>;
}

// bounded in-process bus; one subscriber per (topic, subscription)
pub struct MemoryBus {
  queue_len: usize,
  topics: Mutex<HashMap<String, Vec<mpsc::Sender<MsgPack>>>>,
}

impl MemoryBus {
  pub fn new(queue_len: usize) -> Arc<Self> {
    Arc::new(MemoryBus {
      queue_len,
      topics: Mutex::new(HashMap::new()),
    })
  }
}

pub struct MemoryProducer {
  topic: String,
  bus: Arc<MemoryBus>,
}

pub struct MemoryConsumer {
  rx: mpsc::Receiver<MsgPack>,
}

#[async_trait]
impl MsgProducer for MemoryProducer {
  async fn produce(&self, pack: MsgPack) -> NodeResult<()> {
    let senders = {
      let topics = self.bus.topics.lock().await;
      topics.get(&self.topic).cloned().unwrap_or_default()
    };
    for sender in senders {
      sender
        .send(pack.clone())
        .await
        .map_err(|_| NodeError::transient_io(format!(
          "producing to topic {} failed; subscriber is gone",
          self.topic,
        )))?;
    }
    Ok(())
  }
}

#[async_trait]
impl MsgConsumer for MemoryConsumer {
  async fn consume(&mut self) -> NodeResult<Option<MsgPack>> {
    Ok(self.rx.recv().await)
  }

  async fn seek(&mut self, _position: &StreamPosition) -> NodeResult<()> {
    // the in-process bus holds no history to seek over
    Ok(())
  }
}

#[async_trait]
impl MsgBus for Arc<MemoryBus> {
  async fn as_producer(&self, topic: &str) -> NodeResult<Box<dyn MsgProducer>> {
    Ok(Box::new(MemoryProducer {
      topic: topic.to_string(),
      bus: self.clone(),
    }))
  }

  async fn as_consumer(
    &self,
    topic: &str,
    _subscription: &str,
  ) -> NodeResult<Box<dyn MsgConsumer>> {
    let (tx, rx) = mpsc::channel(self.queue_len);
    self.topics
      .lock()
      .await
      .entry(topic.to_string())
      .or_insert_with(Vec::new)
      .push(tx);
    Ok(Box::new(MemoryConsumer { rx }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_produce_reaches_subscriber() {
    let bus = MemoryBus::new(4);
    let mut consumer = bus.as_consumer("ch-1", "sub").await.unwrap();
    let producer = bus.as_producer("ch-1").await.unwrap();

    producer.produce(MsgPack::default()).await.unwrap();
    let pack = consumer.consume().await.unwrap();
    assert!(pack.is_some());
  }
}
