use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DeliveredMessage, DeliverySource, QueueError, QueuePublisher};
use crate::routing::QueueId;

/// In-process queues for local runs and tests.
///
/// Delivery is at-least-once in the same sense as the real broker: a
/// message may be pushed back with `redeliver` and will be handed out again.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    queues: Arc<Mutex<HashMap<QueueId, VecDeque<DeliveredMessage>>>>,
    sequence: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage; publishes fail while set.
    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Take up to `max` messages from the head of `queue`.
    pub async fn take(&self, queue: &QueueId, max: usize) -> Vec<DeliveredMessage> {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(queue) {
            Some(pending) => {
                let n = max.min(pending.len());
                pending.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    /// Put a message back at the tail of `queue`.
    pub async fn redeliver(&self, queue: &QueueId, message: DeliveredMessage) {
        self.queues
            .lock()
            .await
            .entry(queue.clone())
            .or_default()
            .push_back(message);
    }

    /// Snapshot of pending messages without consuming them.
    #[cfg(test)]
    pub async fn pending(&self, queue: &QueueId) -> Vec<DeliveredMessage> {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|pending| pending.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueuePublisher for InMemoryQueue {
    async fn publish(&self, queue: &QueueId, key: &str, payload: &str) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable {
                queue: queue.to_string(),
                reason: "in-memory queue marked unavailable".to_string(),
            });
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let message = DeliveredMessage {
            message_id: format!("{}/{}", queue, seq),
            key: Some(key.to_string()),
            body: payload.to_string(),
        };

        self.redeliver(queue, message).await;
        Ok(())
    }
}

/// Consumer side of one in-memory queue. Polls with a fixed idle interval.
pub struct InMemorySource {
    queue: InMemoryQueue,
    queue_id: QueueId,
    batch_size: usize,
    idle_poll: Duration,
}

impl InMemorySource {
    pub fn new(queue: InMemoryQueue, queue_id: QueueId, batch_size: usize, idle_poll: Duration) -> Self {
        Self {
            queue,
            queue_id,
            batch_size,
            idle_poll,
        }
    }
}

#[async_trait]
impl DeliverySource for InMemorySource {
    fn queue(&self) -> &QueueId {
        &self.queue_id
    }

    async fn next_batch(&self) -> Result<Vec<DeliveredMessage>, QueueError> {
        let batch = self.queue.take(&self.queue_id, self.batch_size).await;
        if batch.is_empty() {
            tokio::time::sleep(self.idle_poll).await;
        }
        Ok(batch)
    }

    async fn settle(&self, unresolved: Vec<DeliveredMessage>) -> Result<(), QueueError> {
        for message in unresolved {
            self.queue.redeliver(&self.queue_id, message).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_take_in_order() {
        let queue = InMemoryQueue::new();
        let q = QueueId::new("received-queue");

        queue.publish(&q, "k1", "one").await.unwrap();
        queue.publish(&q, "k2", "two").await.unwrap();

        let taken = queue.take(&q, 10).await;
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].body, "one");
        assert_eq!(taken[1].key.as_deref(), Some("k2"));
        assert_ne!(taken[0].message_id, taken[1].message_id);
        assert!(queue.take(&q, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_take_respects_max() {
        let queue = InMemoryQueue::new();
        let q = QueueId::new("q");
        for i in 0..5 {
            queue.publish(&q, "k", &i.to_string()).await.unwrap();
        }

        assert_eq!(queue.take(&q, 2).await.len(), 2);
        assert_eq!(queue.pending(&q).await.len(), 3);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let queue = InMemoryQueue::new();
        queue.publish(&QueueId::new("a"), "k", "x").await.unwrap();

        assert!(queue.take(&QueueId::new("b"), 10).await.is_empty());
        assert_eq!(queue.take(&QueueId::new("a"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_outage_fails_publish() {
        let queue = InMemoryQueue::new();
        let q = QueueId::new("q");
        queue.set_unavailable(true);

        let err = queue.publish(&q, "k", "x").await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { .. }));
        assert!(queue.pending(&q).await.is_empty());
    }

    #[tokio::test]
    async fn test_source_redelivers_unresolved() {
        let queue = InMemoryQueue::new();
        let q = QueueId::new("q");
        queue.publish(&q, "k1", "one").await.unwrap();
        queue.publish(&q, "k2", "two").await.unwrap();

        let source = InMemorySource::new(queue.clone(), q.clone(), 10, Duration::from_millis(1));
        let batch = source.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);

        source.settle(vec![batch[1].clone()]).await.unwrap();

        let again = source.next_batch().await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].body, "two");
        assert_eq!(again[0].message_id, batch[1].message_id);
    }
}
