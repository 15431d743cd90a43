//! Message-queue consumer seam.
//!
//! The ingress only needs long-poll receive and acknowledge; the queue SDK
//! lives behind this trait. [`MemoryQueue`] backs the tests with the same
//! at-least-once semantics: messages are redelivered until acknowledged.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use granary_core::Result;

/// One queue delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Provider message ID; the dedup key.
    pub id: String,
    /// Receipt handle used to acknowledge this delivery.
    pub receipt: String,
    /// Message body.
    pub body: String,
}

/// Long-polling queue consumer.
#[async_trait]
pub trait QueueConsumer: Send + Sync + 'static {
    /// Receives up to `max_messages`, waiting up to `wait` for the first.
    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>>;

    /// Acknowledges (deletes) a delivery.
    async fn acknowledge(&self, message: &QueueMessage) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    /// Deliverable messages.
    ready: VecDeque<QueueMessage>,
    /// Received but not yet acknowledged.
    inflight: Vec<QueueMessage>,
    acked: Vec<String>,
}

/// In-memory [`QueueConsumer`] for tests.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues a message for delivery.
    pub fn push(&self, id: impl Into<String>, body: impl Into<String>) {
        let id = id.into();
        let receipt = format!("receipt-{id}");
        self.lock().ready.push_back(QueueMessage {
            id,
            receipt,
            body: body.into(),
        });
    }

    /// Redelivers everything received but never acknowledged, as a
    /// visibility timeout would.
    pub fn redeliver_unacked(&self) {
        let mut inner = self.lock();
        let inflight = std::mem::take(&mut inner.inflight);
        for message in inflight {
            inner.ready.push_back(message);
        }
    }

    /// IDs acknowledged so far.
    #[must_use]
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    /// Messages waiting for delivery.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut inner = self.lock();
                if !inner.ready.is_empty() {
                    let mut batch = Vec::new();
                    while batch.len() < max_messages.max(1) {
                        let Some(message) = inner.ready.pop_front() else {
                            break;
                        };
                        inner.inflight.push(message.clone());
                        batch.push(message);
                    }
                    return Ok(batch);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<()> {
        let mut inner = self.lock();
        inner.inflight.retain(|m| m.receipt != message.receipt);
        inner.acked.push(message.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_then_ack() {
        let queue = MemoryQueue::new();
        queue.push("m1", "{}");
        queue.push("m2", "{}");

        let batch = queue.receive(10, Duration::ZERO).await.expect("receive");
        assert_eq!(batch.len(), 2);

        queue.acknowledge(&batch[0]).await.expect("ack");
        assert_eq!(queue.acked(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn empty_queue_returns_after_wait() {
        let queue = MemoryQueue::new();
        let batch = queue
            .receive(10, Duration::from_millis(5))
            .await
            .expect("receive");
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn unacked_messages_can_be_redelivered() {
        let queue = MemoryQueue::new();
        queue.push("m1", "{}");
        let batch = queue.receive(1, Duration::ZERO).await.expect("receive");
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.ready_len(), 0);

        queue.redeliver_unacked();
        assert_eq!(queue.ready_len(), 1);
    }
}
