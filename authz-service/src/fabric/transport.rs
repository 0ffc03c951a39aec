//! Transport abstraction for the fabric.
//!
//! Two drivers: the in-memory transport (tests and single-process
//! deployments) and the RabbitMQ driver in `rabbitmq.rs`. Consumers receive
//! `Delivery` values; a request carries a reply slot, a published event does
//! not.

use async_trait::async_trait;
use authz_core::error::AuthzError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

/// One message handed to a consumer.
pub struct Delivery {
    pub payload: Vec<u8>,
    /// Present for request/reply; the consumer must send exactly one reply.
    pub reply: Option<oneshot::Sender<Vec<u8>>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the reply, bounded by `deadline`.
    async fn request(
        &self,
        queue: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>, AuthzError>;

    /// Fire-and-forget publish. Resolves once the transport has durably
    /// accepted the message.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), AuthzError>;

    /// Attach a consumer to a queue.
    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, AuthzError>;
}

/// In-process transport over tokio channels.
pub struct InMemoryTransport {
    queues: RwLock<HashMap<String, mpsc::Sender<Delivery>>>,
    queue_depth: usize,
}

impl InMemoryTransport {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    async fn sender_for(&self, queue: &str) -> Result<mpsc::Sender<Delivery>, AuthzError> {
        self.queues
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| {
                AuthzError::ConsumeFailed(anyhow::anyhow!("no consumer bound to queue {}", queue))
            })
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request(
        &self,
        queue: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>, AuthzError> {
        let sender = self.sender_for(queue).await?;
        let (reply_tx, reply_rx) = oneshot::channel();

        sender
            .send(Delivery {
                payload,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| {
                AuthzError::ConsumeFailed(anyhow::anyhow!("consumer for {} is gone", queue))
            })?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Err(_) => Err(AuthzError::Timeout),
            Ok(Err(_)) => Err(AuthzError::ConsumeFailed(anyhow::anyhow!(
                "consumer dropped the reply for {}",
                queue
            ))),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), AuthzError> {
        let sender = self.sender_for(queue).await?;
        sender
            .send(Delivery {
                payload,
                reply: None,
            })
            .await
            .map_err(|_| AuthzError::PublishFailed(anyhow::anyhow!("queue {} is gone", queue)))
    }

    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, AuthzError> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.queues.write().await.insert(queue.to_string(), tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let transport = InMemoryTransport::new(16);
        let mut rx = transport.subscribe("q").await.unwrap();

        tokio::spawn(async move {
            let delivery = rx.recv().await.unwrap();
            assert_eq!(delivery.payload, b"ping");
            delivery.reply.unwrap().send(b"pong".to_vec()).unwrap();
        });

        let reply = transport
            .request("q", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let transport = InMemoryTransport::new(16);
        let mut rx = transport.subscribe("q").await.unwrap();

        tokio::spawn(async move {
            // Swallow the delivery without replying.
            let _delivery = rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = transport
            .request("q", b"ping".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Timeout));
    }

    #[tokio::test]
    async fn test_request_without_consumer_fails() {
        let transport = InMemoryTransport::new(16);
        let err = transport
            .request("nowhere", b"ping".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::ConsumeFailed(_)));
    }

    #[tokio::test]
    async fn test_publish_delivers_without_reply_slot() {
        let transport = InMemoryTransport::new(16);
        let mut rx = transport.subscribe("events").await.unwrap();

        transport
            .publish("events", b"evt".to_vec())
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.payload, b"evt");
        assert!(delivery.reply.is_none());
    }
}
