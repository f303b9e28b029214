// ============================================================================
// Messaging - status queues and the notifier publishing onto them
// ============================================================================

mod memory;
mod notifier;
mod redpanda;

use async_trait::async_trait;

use crate::routing::QueueId;

pub use memory::{InMemoryQueue, InMemorySource};
pub use notifier::{Notifier, NotifyError};
pub use redpanda::{RedpandaClient, RedpandaSource};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue {queue} unavailable: {reason}")]
    Unavailable { queue: String, reason: String },

    #[error("Circuit breaker open for queue {0}")]
    CircuitOpen(String),
}

/// A message as handed to a consumer by its queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredMessage {
    /// Queue-assigned identifier, unique per delivery position
    pub message_id: String,
    pub key: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, queue: &QueueId, key: &str, payload: &str) -> Result<(), QueueError>;
}

/// Consumer side of one status queue.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    fn queue(&self) -> &QueueId;

    /// Next batch of deliveries; may be empty when the queue is idle.
    async fn next_batch(&self) -> Result<Vec<DeliveredMessage>, QueueError>;

    /// Acknowledge the last batch. `unresolved` messages must be delivered
    /// again later.
    async fn settle(&self, unresolved: Vec<DeliveredMessage>) -> Result<(), QueueError>;
}
