use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use super::consumer::{ConsumeOutcome, StatusConsumer};
use crate::messaging::{DeliveredMessage, DeliverySource, QueueError};
use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};

// ============================================================================
// Consumer Runner - drives one status consumer from its queue
// ============================================================================
//
// Pulls a batch, lets the consumer settle each message independently, then
// retries the `Retry` ones with exponential backoff. A message that exhausts
// its retries is dead-lettered. Whatever is still unresolved after that is
// handed back to the source for redelivery.
//
// ============================================================================

pub struct ConsumerRunner {
    source: Box<dyn DeliverySource>,
    consumer: Arc<StatusConsumer>,
    retry: RetryConfig,
}

impl ConsumerRunner {
    pub fn new(source: Box<dyn DeliverySource>, consumer: Arc<StatusConsumer>, retry: RetryConfig) -> Self {
        Self {
            source,
            consumer,
            retry,
        }
    }

    /// Run until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            queue = %self.source.queue(),
            status = %self.consumer.status(),
            "Consumer runner started"
        );

        loop {
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = self.source.next_batch() => batch,
            };

            match batch {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => {
                    if let Err(e) = self.run_batch(batch).await {
                        tracing::error!(queue = %self.source.queue(), error = %e, "Failed to settle batch");
                    }
                }
                Err(e) => {
                    tracing::warn!(queue = %self.source.queue(), error = %e, "Failed to fetch batch");
                    tokio::time::sleep(self.retry.initial_delay).await;
                }
            }
        }

        tracing::info!(queue = %self.source.queue(), "Consumer runner stopped");
    }

    /// Process one batch and settle it with the source. Returns the final
    /// outcome per message id.
    pub async fn run_batch(
        &self,
        batch: Vec<DeliveredMessage>,
    ) -> Result<Vec<(String, ConsumeOutcome)>, QueueError> {
        let first_pass = self.consumer.handle_batch(&batch).await;

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut unresolved = Vec::new();

        for (message, (message_id, outcome)) in batch.into_iter().zip(first_pass) {
            let outcome = if outcome.is_resolved() {
                outcome
            } else {
                self.redeliver(&message).await
            };

            if !outcome.is_resolved() {
                unresolved.push(message);
            }
            outcomes.push((message_id, outcome));
        }

        if !unresolved.is_empty() {
            tracing::warn!(
                queue = %self.source.queue(),
                unresolved = unresolved.len(),
                "Returning unresolved messages for redelivery"
            );
        }

        self.source.settle(unresolved).await?;
        Ok(outcomes)
    }

    /// Up to `max_attempts` further attempts for a message that asked to be
    /// retried, then the dead-letter sink. A key still leased by another
    /// delivery is handed back to the queue instead.
    async fn redeliver(&self, message: &DeliveredMessage) -> ConsumeOutcome {
        let consumer = &self.consumer;
        let result = retry_with_backoff(&self.retry, "consume_notification", |_| async move {
            match consumer.handle(message).await {
                ConsumeOutcome::Retry { reason, lease_held } => Err(Unsettled { reason, lease_held }),
                outcome => Ok(outcome),
            }
        })
        .await;

        match result {
            RetryResult::Success(outcome) => outcome,
            RetryResult::Exhausted { last_error, .. } if last_error.lease_held => ConsumeOutcome::Retry {
                reason: last_error.reason,
                lease_held: true,
            },
            RetryResult::Exhausted {
                attempts,
                last_error,
            } => {
                let reason = format!("retries exhausted after {} attempts: {}", attempts, last_error);
                consumer.dead_letter(message, &reason).await
            }
        }
    }
}

struct Unsettled {
    reason: String,
    lease_held: bool,
}

impl fmt::Display for Unsettled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumers::consumer::tests::{consumer, delivered, CountingEffect};
    use crate::consumers::consumer::EffectError;
    use crate::consumers::dlq::{DeadLetter, DeadLetterError, DeadLetterSink, InMemoryDeadLetters};
    use crate::consumers::ledger::{InMemoryLedger, ProcessedLedger};
    use crate::domain::order::dedupe_key;
    use crate::domain::order::OrderStatus;
    use crate::messaging::{InMemoryQueue, InMemorySource, QueuePublisher};
    use crate::routing::QueueId;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn transient(failures: u32) -> Arc<CountingEffect> {
        Arc::new(CountingEffect::failing(
            failures,
            Some(EffectError::Transient("busy".to_string())),
        ))
    }

    struct DownSink;

    #[async_trait]
    impl DeadLetterSink for DownSink {
        async fn store(&self, _: DeadLetter) -> Result<(), DeadLetterError> {
            Err(DeadLetterError("down".to_string()))
        }
    }

    fn runner(
        queue: &InMemoryQueue,
        sink: Arc<dyn DeadLetterSink>,
        effect: Arc<CountingEffect>,
    ) -> ConsumerRunner {
        let source = InMemorySource::new(
            queue.clone(),
            QueueId::new("received-queue"),
            10,
            Duration::from_millis(1),
        );
        let ledger = Arc::new(InMemoryLedger::new(Duration::from_secs(60), Duration::from_secs(5)));
        ConsumerRunner::new(
            Box::new(source),
            Arc::new(consumer(ledger, sink, effect)),
            fast_retry(),
        )
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_batch() {
        let queue = InMemoryQueue::new();
        let effect = transient(2);
        let runner = runner(&queue, Arc::new(InMemoryDeadLetters::new()), effect.clone());

        let outcomes = runner
            .run_batch(vec![delivered("m-1", "O1", 1, OrderStatus::Received)])
            .await
            .unwrap();

        assert_eq!(outcomes[0].1, ConsumeOutcome::Processed);
        assert_eq!(effect.calls.load(Ordering::SeqCst), 3);
        assert!(queue.pending(&QueueId::new("received-queue")).await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dead_lettered() {
        let queue = InMemoryQueue::new();
        let sink = InMemoryDeadLetters::new();
        let effect = transient(u32::MAX);
        let runner = runner(&queue, Arc::new(sink.clone()), effect.clone());

        let outcomes = runner
            .run_batch(vec![
                delivered("m-1", "O1", 1, OrderStatus::Received),
                delivered("m-2", "O2", 1, OrderStatus::Received),
            ])
            .await
            .unwrap();

        assert!(outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, ConsumeOutcome::DeadLettered { .. })));
        // One pass in the batch plus three retries each.
        assert_eq!(effect.calls.load(Ordering::SeqCst), 8);

        let letters = sink.letters().await;
        assert_eq!(letters.len(), 2);
        assert!(letters[0].error_message.contains("retries exhausted"));
    }

    #[tokio::test]
    async fn test_unresolved_messages_go_back_to_queue() {
        let queue = InMemoryQueue::new();
        let runner = runner(&queue, Arc::new(DownSink), transient(u32::MAX));

        let outcomes = runner
            .run_batch(vec![delivered("m-1", "O1", 1, OrderStatus::Received)])
            .await
            .unwrap();

        assert!(matches!(outcomes[0].1, ConsumeOutcome::Retry { .. }));
        let pending = queue.pending(&QueueId::new("received-queue")).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "m-1");
    }

    #[tokio::test]
    async fn test_leased_key_goes_back_to_queue_not_dead_letters() {
        let queue = InMemoryQueue::new();
        let sink = InMemoryDeadLetters::new();
        let ledger = Arc::new(InMemoryLedger::new(Duration::from_secs(60), Duration::from_secs(5)));
        let message = delivered("m-1", "O1", 1, OrderStatus::Received);
        // Another worker is mid-effect on the same key.
        ledger.begin(&dedupe_key("O1", 1)).await.unwrap();

        let effect = Arc::new(CountingEffect::ok());
        let source = InMemorySource::new(
            queue.clone(),
            QueueId::new("received-queue"),
            10,
            Duration::from_millis(1),
        );
        let runner = ConsumerRunner::new(
            Box::new(source),
            Arc::new(consumer(ledger, Arc::new(sink.clone()), effect.clone())),
            fast_retry(),
        );

        let outcomes = runner.run_batch(vec![message]).await.unwrap();

        assert!(matches!(outcomes[0].1, ConsumeOutcome::Retry { lease_held: true, .. }));
        assert_eq!(effect.calls.load(Ordering::SeqCst), 0);
        assert!(sink.letters().await.is_empty());
        assert_eq!(queue.pending(&QueueId::new("received-queue")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let queue = InMemoryQueue::new();
        let effect = Arc::new(CountingEffect::ok());
        let runner = runner(&queue, Arc::new(InMemoryDeadLetters::new()), effect.clone());

        let q = QueueId::new("received-queue");
        for (order_id, message) in [("O1", "m-1"), ("O2", "m-2")] {
            let body = delivered(message, order_id, 1, OrderStatus::Received);
            queue
                .publish(&q, body.key.as_deref().unwrap(), &body.body)
                .await
                .unwrap();
        }
        // Same notification published twice.
        let dup = delivered("m-3", "O1", 1, OrderStatus::Received);
        queue.publish(&q, dup.key.as_deref().unwrap(), &dup.body).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !queue.pending(&q).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(effect.calls.load(Ordering::SeqCst), 2);
    }
}
