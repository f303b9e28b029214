use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;

use super::{DeliveredMessage, DeliverySource, QueueError, QueuePublisher};
use crate::routing::QueueId;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

// ============================================================================
// Redpanda (Kafka API) - one topic per status queue
// ============================================================================

pub struct RedpandaClient {
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
    send_timeout: Duration,
}

impl RedpandaClient {
    pub fn new(
        brokers: &str,
        send_timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .set("enable.idempotence", "true")
            .create()?;

        Ok(Self {
            producer,
            circuit_breaker: CircuitBreaker::new("redpanda-publisher", breaker),
            send_timeout,
        })
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state().await
    }
}

#[async_trait]
impl QueuePublisher for RedpandaClient {
    async fn publish(&self, queue: &QueueId, key: &str, payload: &str) -> Result<(), QueueError> {
        let result = self
            .circuit_breaker
            .call(async {
                let record = FutureRecord::to(queue.as_str()).key(key).payload(payload);

                self.producer
                    .send(record, Timeout::After(self.send_timeout))
                    .await
                    .map(|_| ())
                    .map_err(|(e, _)| e)
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(queue = %queue, key = %key, "Published to Redpanda");
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(queue = %queue, "Circuit breaker open - Redpanda unavailable");
                Err(QueueError::CircuitOpen(queue.to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, queue = %queue, "Failed to publish to Redpanda");
                Err(QueueError::Unavailable {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Batching consumer for one status topic. Offsets are committed manually
/// once a whole batch is settled.
pub struct RedpandaSource {
    consumer: StreamConsumer,
    queue: QueueId,
    batch_size: usize,
    linger: Duration,
}

impl RedpandaSource {
    pub fn subscribe(
        brokers: &str,
        group_id: &str,
        queue: QueueId,
        batch_size: usize,
        linger: Duration,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        consumer.subscribe(&[queue.as_str()])?;
        tracing::info!(queue = %queue, group_id = %group_id, "Subscribed to status topic");

        Ok(Self {
            consumer,
            queue,
            batch_size,
            linger,
        })
    }

    fn unavailable(&self, e: KafkaError) -> QueueError {
        QueueError::Unavailable {
            queue: self.queue.to_string(),
            reason: e.to_string(),
        }
    }
}

fn to_delivered(message: &BorrowedMessage<'_>) -> DeliveredMessage {
    let body = match message.payload_view::<str>() {
        Some(Ok(text)) => text.to_string(),
        Some(Err(_)) => String::from_utf8_lossy(message.payload().unwrap_or_default()).into_owned(),
        None => String::new(),
    };

    DeliveredMessage {
        message_id: format!("{}/{}/{}", message.topic(), message.partition(), message.offset()),
        key: message
            .key_view::<str>()
            .and_then(|key| key.ok())
            .map(str::to_string),
        body,
    }
}

#[async_trait]
impl DeliverySource for RedpandaSource {
    fn queue(&self) -> &QueueId {
        &self.queue
    }

    async fn next_batch(&self) -> Result<Vec<DeliveredMessage>, QueueError> {
        let first = to_delivered(&self.consumer.recv().await.map_err(|e| self.unavailable(e))?);
        let mut batch = vec![first];

        let deadline = tokio::time::Instant::now() + self.linger;
        while batch.len() < self.batch_size {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.push(to_delivered(&message)),
                Ok(Err(e)) => {
                    tracing::warn!(queue = %self.queue, error = %e, "Receive failed mid-batch");
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    async fn settle(&self, unresolved: Vec<DeliveredMessage>) -> Result<(), QueueError> {
        if unresolved.is_empty() {
            return self
                .consumer
                .commit_consumer_state(CommitMode::Async)
                .map_err(|e| self.unavailable(e));
        }

        // Kafka has no per-message nack: rejoin so fetching resumes from the
        // last committed offset and the unresolved messages come back. The
        // settled ones come back too; they find a done ledger key or rewrite
        // their own dead-letter row.
        tracing::warn!(
            queue = %self.queue,
            unresolved = unresolved.len(),
            "Batch not fully settled, rewinding to committed offsets"
        );
        self.consumer.unsubscribe();
        self.consumer
            .subscribe(&[self.queue.as_str()])
            .map_err(|e| self.unavailable(e))
    }
}
