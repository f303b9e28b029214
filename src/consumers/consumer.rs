use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use super::dlq::{DeadLetter, DeadLetterSink};
use super::ledger::{ClaimState, ProcessedLedger};
use crate::domain::order::{OrderStatus, StatusChangeNotification};
use crate::messaging::DeliveredMessage;
use crate::metrics::Metrics;
use crate::routing::QueueId;

// ============================================================================
// Status Consumer
// ============================================================================
//
// One per status queue. Each delivery is decoded, leased in the processed-key
// ledger by its dedupe key, then handed to the status effect. The key is marked
// done only after the effect succeeds; redeliveries of a done key are
// acknowledged without acting again, redeliveries of a leased key are retried.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Processed,
    AlreadyProcessed,
    /// Not acknowledged; the message must be delivered again. `lease_held`
    /// means another delivery of the same key is still running its effect.
    Retry { reason: String, lease_held: bool },
    /// Stored in the dead-letter sink and acknowledged.
    DeadLettered { reason: String },
}

impl ConsumeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::AlreadyProcessed => "already_processed",
            Self::Retry { .. } => "retry",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EffectError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

/// What a consumer does with a status change it has claimed.
#[async_trait]
pub trait StatusEffect: Send + Sync {
    async fn apply(&self, notification: &StatusChangeNotification) -> Result<(), EffectError>;
}

/// Default effect: record receipt of the notification.
pub struct LoggingEffect;

#[async_trait]
impl StatusEffect for LoggingEffect {
    async fn apply(&self, notification: &StatusChangeNotification) -> Result<(), EffectError> {
        tracing::info!(
            order_id = %notification.order_id,
            from_status = ?notification.from_status,
            to_status = %notification.to_status,
            dedupe_key = %notification.dedupe_key,
            "📥 Status change received"
        );
        Ok(())
    }
}

pub struct StatusConsumer {
    status: OrderStatus,
    queue: QueueId,
    ledger: Arc<dyn ProcessedLedger>,
    dead_letters: Arc<dyn DeadLetterSink>,
    effect: Arc<dyn StatusEffect>,
    metrics: Arc<Metrics>,
}

impl StatusConsumer {
    pub fn new(
        status: OrderStatus,
        queue: QueueId,
        ledger: Arc<dyn ProcessedLedger>,
        dead_letters: Arc<dyn DeadLetterSink>,
        effect: Arc<dyn StatusEffect>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            status,
            queue,
            ledger,
            dead_letters,
            effect,
            metrics,
        }
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Process a batch; every message gets its own outcome.
    pub async fn handle_batch(&self, messages: &[DeliveredMessage]) -> Vec<(String, ConsumeOutcome)> {
        join_all(messages.iter().map(|message| async move {
            (message.message_id.clone(), self.handle(message).await)
        }))
        .await
    }

    pub async fn handle(&self, message: &DeliveredMessage) -> ConsumeOutcome {
        let outcome = self.process(message).await;

        self.metrics
            .consumer_messages
            .with_label_values(&[self.status.as_str(), outcome.label()])
            .inc();

        match &outcome {
            ConsumeOutcome::Retry { reason, .. } => tracing::warn!(
                queue = %self.queue,
                message_id = %message.message_id,
                reason = %reason,
                "Message processing failed transiently"
            ),
            other => tracing::debug!(
                queue = %self.queue,
                message_id = %message.message_id,
                outcome = other.label(),
                "Message settled"
            ),
        }

        outcome
    }

    async fn process(&self, message: &DeliveredMessage) -> ConsumeOutcome {
        let notification = match StatusChangeNotification::from_json(&message.body) {
            Ok(notification) => notification,
            Err(e) => return self.dead_letter(message, &format!("undecodable message: {}", e)).await,
        };

        if notification.to_status != self.status {
            let reason = format!(
                "notification for status '{}' delivered to the '{}' consumer",
                notification.to_status, self.status
            );
            return self.dead_letter(message, &reason).await;
        }

        let key = notification.dedupe_key.as_str();
        match self.ledger.begin(key).await {
            Ok(ClaimState::Claimed) => {}
            Ok(ClaimState::Done) => return ConsumeOutcome::AlreadyProcessed,
            Ok(ClaimState::InProgress) => {
                return ConsumeOutcome::Retry {
                    reason: format!("dedupe key {} is being processed by another delivery", key),
                    lease_held: true,
                }
            }
            Err(e) => {
                return ConsumeOutcome::Retry {
                    reason: e.to_string(),
                    lease_held: false,
                }
            }
        }

        match self.effect.apply(&notification).await {
            Ok(()) => {
                self.complete(key).await;
                ConsumeOutcome::Processed
            }
            Err(EffectError::Transient(reason)) => {
                self.release(key).await;
                ConsumeOutcome::Retry {
                    reason,
                    lease_held: false,
                }
            }
            Err(EffectError::Permanent(reason)) => {
                let outcome = self.dead_letter(message, &reason).await;
                if outcome.is_resolved() {
                    self.complete(key).await;
                } else {
                    // Not stored anywhere: the next delivery must be able to claim again.
                    self.release(key).await;
                }
                outcome
            }
        }
    }

    async fn complete(&self, key: &str) {
        if let Err(e) = self.ledger.complete(key).await {
            // The lease lapses and a redelivery acts again.
            tracing::warn!(dedupe_key = %key, error = %e, "Failed to mark key as processed");
        }
    }

    async fn release(&self, key: &str) {
        if let Err(e) = self.ledger.release(key).await {
            // The lease expires on its own.
            tracing::warn!(dedupe_key = %key, error = %e, "Failed to release lease");
        }
    }

    /// Store `message` in the dead-letter sink. A sink failure leaves the
    /// message unacknowledged.
    pub async fn dead_letter(&self, message: &DeliveredMessage, reason: &str) -> ConsumeOutcome {
        let letter = DeadLetter::new(self.queue.as_str(), &message.message_id, &message.body, reason);

        match self.dead_letters.store(letter).await {
            Ok(()) => {
                self.metrics
                    .dead_lettered
                    .with_label_values(&[self.queue.as_str()])
                    .inc();
                ConsumeOutcome::DeadLettered {
                    reason: reason.to_string(),
                }
            }
            Err(e) => ConsumeOutcome::Retry {
                reason: e.to_string(),
                lease_held: false,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::consumers::dlq::{DeadLetterError, InMemoryDeadLetters};
    use crate::consumers::ledger::{InMemoryLedger, LedgerError};
    use std::future::pending;
    use crate::domain::order::{dedupe_key, Order};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Counts applications; fails the first `failures` calls with `error`.
    pub(crate) struct CountingEffect {
        pub calls: AtomicU32,
        failures: u32,
        error: Option<EffectError>,
    }

    impl CountingEffect {
        pub(crate) fn ok() -> Self {
            Self::failing(0, None)
        }

        pub(crate) fn failing(failures: u32, error: Option<EffectError>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
            }
        }
    }

    #[async_trait]
    impl StatusEffect for CountingEffect {
        async fn apply(&self, _: &StatusChangeNotification) -> Result<(), EffectError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.error {
                Some(error) if call < self.failures => Err(error.clone()),
                _ => Ok(()),
            }
        }
    }

    struct DownLedger;

    #[async_trait]
    impl ProcessedLedger for DownLedger {
        async fn begin(&self, _: &str) -> Result<ClaimState, LedgerError> {
            Err(LedgerError("connection refused".to_string()))
        }

        async fn complete(&self, _: &str) -> Result<(), LedgerError> {
            Err(LedgerError("connection refused".to_string()))
        }

        async fn release(&self, _: &str) -> Result<(), LedgerError> {
            Err(LedgerError("connection refused".to_string()))
        }
    }

    struct DownSink;

    #[async_trait]
    impl DeadLetterSink for DownSink {
        async fn store(&self, _: DeadLetter) -> Result<(), DeadLetterError> {
            Err(DeadLetterError("table missing".to_string()))
        }
    }

    pub(crate) fn delivered(message_id: &str, order_id: &str, version: i64, to: OrderStatus) -> DeliveredMessage {
        let order = Order {
            order_id: order_id.to_string(),
            status: to,
            description: "Test order".to_string(),
            register_date: Utc::now(),
            delivery_date: None,
            reason_for_cancellation: None,
            version,
        };
        let notification = StatusChangeNotification::for_write(None, &order);
        DeliveredMessage {
            message_id: message_id.to_string(),
            key: Some(dedupe_key(order_id, version)),
            body: notification.to_json().unwrap(),
        }
    }

    pub(crate) fn consumer(
        ledger: Arc<dyn ProcessedLedger>,
        sink: Arc<dyn DeadLetterSink>,
        effect: Arc<dyn StatusEffect>,
    ) -> StatusConsumer {
        StatusConsumer::new(
            OrderStatus::Received,
            QueueId::new("received-queue"),
            ledger,
            sink,
            effect,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    /// Never finishes; stands in for a worker that is killed mid-effect.
    struct StalledEffect;

    #[async_trait]
    impl StatusEffect for StalledEffect {
        async fn apply(&self, _: &StatusChangeNotification) -> Result<(), EffectError> {
            pending().await
        }
    }

    fn ledger() -> Arc<InMemoryLedger> {
        Arc::new(InMemoryLedger::new(Duration::from_secs(60), Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_redelivery_acts_once() {
        let effect = Arc::new(CountingEffect::ok());
        let consumer = consumer(ledger(), Arc::new(InMemoryDeadLetters::new()), effect.clone());

        let first = delivered("m-1", "O1", 1, OrderStatus::Received);
        let again = DeliveredMessage {
            message_id: "m-7".to_string(),
            ..first.clone()
        };

        assert_eq!(consumer.handle(&first).await, ConsumeOutcome::Processed);
        assert_eq!(consumer.handle(&again).await, ConsumeOutcome::AlreadyProcessed);
        assert_eq!(consumer.handle(&first).await, ConsumeOutcome::AlreadyProcessed);
        assert_eq!(effect.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicates_in_one_batch_act_once() {
        let effect = Arc::new(CountingEffect::ok());
        let consumer = consumer(ledger(), Arc::new(InMemoryDeadLetters::new()), effect.clone());

        let message = delivered("m-1", "O1", 1, OrderStatus::Received);
        let batch = vec![message.clone(), message.clone(), message];

        let outcomes = consumer.handle_batch(&batch).await;
        let processed = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == ConsumeOutcome::Processed)
            .count();
        assert_eq!(processed, 1);
        // The copies either saw the lease or the done marker.
        assert!(outcomes.iter().all(|(_, outcome)| matches!(
            outcome,
            ConsumeOutcome::Processed | ConsumeOutcome::AlreadyProcessed | ConsumeOutcome::Retry { .. }
        )));
        assert_eq!(effect.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupted_effect_runs_again_after_lease() {
        let ledger = Arc::new(InMemoryLedger::new(
            Duration::from_secs(60),
            Duration::from_millis(200),
        ));
        let sink: Arc<dyn DeadLetterSink> = Arc::new(InMemoryDeadLetters::new());
        let message = delivered("m-1", "O1", 1, OrderStatus::Received);

        // Worker dies while the effect is running.
        let stalled = consumer(ledger.clone(), sink.clone(), Arc::new(StalledEffect));
        let cut_short = tokio::time::timeout(Duration::from_millis(10), stalled.handle(&message)).await;
        assert!(cut_short.is_err());
        assert_eq!(ledger.state(&dedupe_key("O1", 1)).await, Some(ClaimState::InProgress));

        let effect = Arc::new(CountingEffect::ok());
        let healthy = consumer(ledger.clone(), sink, effect.clone());

        // Still leased: not acknowledged, not acted on.
        assert!(matches!(
            healthy.handle(&message).await,
            ConsumeOutcome::Retry { lease_held: true, .. }
        ));
        assert_eq!(effect.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(healthy.handle(&message).await, ConsumeOutcome::Processed);
        assert_eq!(effect.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.handle(&message).await, ConsumeOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_bad_message_does_not_block_batch() {
        let sink = InMemoryDeadLetters::new();
        let consumer = consumer(ledger(), Arc::new(sink.clone()), Arc::new(CountingEffect::ok()));

        let garbage = DeliveredMessage {
            message_id: "m-2".to_string(),
            key: None,
            body: "not json".to_string(),
        };
        let batch = vec![
            delivered("m-1", "O1", 1, OrderStatus::Received),
            garbage,
            delivered("m-3", "O2", 1, OrderStatus::Received),
        ];

        let outcomes = consumer.handle_batch(&batch).await;
        assert_eq!(outcomes[0], ("m-1".to_string(), ConsumeOutcome::Processed));
        assert!(matches!(outcomes[1].1, ConsumeOutcome::DeadLettered { .. }));
        assert_eq!(outcomes[2], ("m-3".to_string(), ConsumeOutcome::Processed));

        let letters = sink.letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message_id, "m-2");
        assert_eq!(letters[0].payload, "not json");
    }

    #[tokio::test]
    async fn test_misrouted_notification_is_dead_lettered() {
        let sink = InMemoryDeadLetters::new();
        let effect = Arc::new(CountingEffect::ok());
        let consumer = consumer(ledger(), Arc::new(sink.clone()), effect.clone());

        let outcome = consumer
            .handle(&delivered("m-1", "O1", 2, OrderStatus::InProcess))
            .await;
        assert!(matches!(outcome, ConsumeOutcome::DeadLettered { .. }));
        assert_eq!(effect.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_bad_message_keeps_one_dead_letter() {
        let sink = InMemoryDeadLetters::new();
        let consumer = consumer(ledger(), Arc::new(sink.clone()), Arc::new(CountingEffect::ok()));
        let garbage = DeliveredMessage {
            message_id: "received-queue/0/41".to_string(),
            key: None,
            body: "not json".to_string(),
        };
        let misrouted = delivered("received-queue/0/42", "O1", 2, OrderStatus::InProcess);

        // The broker hands the whole uncommitted batch back after a rewind.
        for _ in 0..2 {
            let outcomes = consumer.handle_batch(&[garbage.clone(), misrouted.clone()]).await;
            assert!(outcomes
                .iter()
                .all(|(_, outcome)| matches!(outcome, ConsumeOutcome::DeadLettered { .. })));
        }

        let letters = sink.letters().await;
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].message_id, "received-queue/0/41");
        assert_eq!(letters[1].message_id, "received-queue/0/42");
    }

    #[tokio::test]
    async fn test_transient_effect_failure_releases_lease() {
        let effect = Arc::new(CountingEffect::failing(
            1,
            Some(EffectError::Transient("downstream busy".to_string())),
        ));
        let consumer = consumer(ledger(), Arc::new(InMemoryDeadLetters::new()), effect.clone());
        let message = delivered("m-1", "O1", 1, OrderStatus::Received);

        assert!(matches!(consumer.handle(&message).await, ConsumeOutcome::Retry { .. }));
        assert_eq!(consumer.handle(&message).await, ConsumeOutcome::Processed);
        assert_eq!(effect.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_effect_failure_is_dead_lettered_once() {
        let sink = InMemoryDeadLetters::new();
        let effect = Arc::new(CountingEffect::failing(
            10,
            Some(EffectError::Permanent("order unknown downstream".to_string())),
        ));
        let consumer = consumer(ledger(), Arc::new(sink.clone()), effect.clone());
        let message = delivered("m-1", "O1", 1, OrderStatus::Received);

        assert!(matches!(consumer.handle(&message).await, ConsumeOutcome::DeadLettered { .. }));
        assert_eq!(consumer.handle(&message).await, ConsumeOutcome::AlreadyProcessed);
        assert_eq!(sink.letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_outage_is_retry() {
        let effect = Arc::new(CountingEffect::ok());
        let consumer = consumer(Arc::new(DownLedger), Arc::new(InMemoryDeadLetters::new()), effect.clone());

        let outcome = consumer.handle(&delivered("m-1", "O1", 1, OrderStatus::Received)).await;
        assert!(matches!(outcome, ConsumeOutcome::Retry { .. }));
        assert_eq!(effect.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sink_outage_keeps_message_unacknowledged() {
        let ledger = ledger();
        let effect = Arc::new(CountingEffect::failing(
            10,
            Some(EffectError::Permanent("bad".to_string())),
        ));
        let consumer = consumer(ledger.clone(), Arc::new(DownSink), effect);

        let outcome = consumer.handle(&delivered("m-1", "O1", 1, OrderStatus::Received)).await;
        assert!(matches!(outcome, ConsumeOutcome::Retry { .. }));
        assert_eq!(ledger.state(&dedupe_key("O1", 1)).await, None);
    }
}
