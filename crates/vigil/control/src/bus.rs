//! Publish/subscribe message bus.
//!
//! The engine only needs three verbs: fire-and-forget publish, topic
//! subscription, and request/reply with a timeout. [`InMemoryBus`] provides
//! all three in-process over broadcast channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::{BusError, BusResult};

/// Per-topic channel capacity
const TOPIC_CHANNEL_CAPACITY: usize = 4096;

/// A message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub reply_to: Option<String>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            reply_to: None,
        }
    }

    /// Encode `value` as a JSON message.
    pub fn json<T: Serialize + ?Sized>(topic: impl Into<String>, value: &T) -> BusResult<Self> {
        Ok(Self::new(topic, serde_json::to_vec(value)?))
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> BusResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Transport used by the engine and its collaborators.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish without waiting for anyone.
    fn publish(&self, message: BusMessage) -> BusResult<()>;

    /// Receive every message published on `topic` from now on.
    fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>>;

    /// Publish on `topic` and wait up to `timeout` for a single reply.
    async fn request(&self, topic: &str, payload: Vec<u8>, timeout: Duration)
        -> BusResult<BusMessage>;
}

/// In-process bus backed by one broadcast channel per topic.
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<BusMessage>>,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse every further publish and request.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Accept publishes again after [`InMemoryBus::close`].
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn publish(&self, message: BusMessage) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let delivered = self
            .topics
            .get(&message.topic)
            .map(|tx| tx.send(message.clone()).unwrap_or(0))
            .unwrap_or(0);
        trace!(topic = %message.topic, delivered, "Published");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        debug!(topic, "Subscribed");
        Ok(self.sender(topic).subscribe())
    }

    async fn request(
        &self,
        topic: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BusResult<BusMessage> {
        if self.subscriber_count(topic) == 0 {
            return Err(BusError::NoResponders(topic.to_string()));
        }

        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut replies = self.subscribe(&inbox)?;
        self.publish(BusMessage::new(topic, payload).with_reply_to(inbox.clone()))?;

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match replies.recv().await {
                    Ok(reply) => return Ok(reply),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(inbox = %inbox, lagged = n, "Reply inbox lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
                }
            }
        })
        .await;

        drop(replies);
        self.topics.remove(&inbox);

        match outcome {
            Ok(reply) => reply,
            Err(_) => Err(BusError::Timeout {
                topic: topic.to_string(),
                after: timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("dea.heartbeat").unwrap();

        bus.publish(BusMessage::new("dea.heartbeat", b"{}".to_vec()))
            .unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.payload, b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InMemoryBus::new();
        assert!(bus.publish(BusMessage::new("nowhere", Vec::new())).is_ok());
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_publish() {
        let bus = InMemoryBus::new();
        bus.close();
        assert!(matches!(
            bus.publish(BusMessage::new("t", Vec::new())),
            Err(BusError::Closed)
        ));
        bus.reopen();
        assert!(bus.publish(BusMessage::new("t", Vec::new())).is_ok());
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = Arc::new(InMemoryBus::new());
        let mut requests = bus.subscribe("creds").unwrap();

        let responder = Arc::clone(&bus);
        tokio::spawn(async move {
            if let Ok(request) = requests.recv().await {
                if let Some(inbox) = request.reply_to {
                    responder
                        .publish(BusMessage::new(inbox, b"secret".to_vec()))
                        .unwrap();
                }
            }
        });

        let reply = bus
            .request("creds", Vec::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"secret".to_vec());
    }

    #[tokio::test]
    async fn test_request_without_responder() {
        let bus = InMemoryBus::new();
        let err = bus
            .request("creds", Vec::new(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponders(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let bus = InMemoryBus::new();
        let _silent = bus.subscribe("creds").unwrap();

        let err = bus
            .request("creds", Vec::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }

    #[test]
    fn test_json_roundtrip() {
        let message = BusMessage::json("t", &serde_json::json!({"seconds": 5.0})).unwrap();
        let value: serde_json::Value = message.decode().unwrap();
        assert_eq!(value["seconds"], 5.0);
    }
}
