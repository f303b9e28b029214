use std::sync::Arc;
use std::time::Duration;

use super::{QueueError, QueuePublisher};
use crate::domain::order::{OrderStatus, StatusChangeNotification};
use crate::metrics::Metrics;
use crate::routing::{QueueId, StatusRegistry};

// ============================================================================
// Notifier - publishes status changes to the queue of the target status
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub queue: QueueId,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NotifyError {
    /// The registry has no queue for the status. Operator-fixable, never retried.
    #[error("No queue configured for status '{0}'")]
    Unmapped(OrderStatus),

    #[error("Publishing to {queue} failed: {reason}")]
    Transient { queue: QueueId, reason: String },
}

pub struct Notifier {
    registry: Arc<StatusRegistry>,
    publisher: Arc<dyn QueuePublisher>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Notifier {
    pub fn new(
        registry: Arc<StatusRegistry>,
        publisher: Arc<dyn QueuePublisher>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            publisher,
            timeout,
            metrics,
        }
    }

    /// Publish `notification` keyed by its dedupe key. A publish that does
    /// not complete within the timeout counts as a transient failure.
    pub async fn publish(&self, notification: &StatusChangeNotification) -> Result<Ack, NotifyError> {
        let queue = self
            .registry
            .queue_for(notification.to_status)
            .cloned()
            .ok_or(NotifyError::Unmapped(notification.to_status))?;

        let payload = notification.to_json().map_err(|e| NotifyError::Transient {
            queue: queue.clone(),
            reason: format!("encoding failed: {}", e),
        })?;

        let outcome = tokio::time::timeout(
            self.timeout,
            self.publisher.publish(&queue, &notification.dedupe_key, &payload),
        )
        .await;

        let reason = match outcome {
            Ok(Ok(())) => {
                self.metrics
                    .notifications_published
                    .with_label_values(&[queue.as_str()])
                    .inc();
                tracing::info!(
                    order_id = %notification.order_id,
                    to_status = %notification.to_status,
                    queue = %queue,
                    dedupe_key = %notification.dedupe_key,
                    "📤 Status change published"
                );
                return Ok(Ack { queue });
            }
            Ok(Err(QueueError::CircuitOpen(_))) => ("circuit_open", "circuit breaker open".to_string()),
            Ok(Err(e)) => ("unavailable", e.to_string()),
            Err(_) => ("timeout", format!("no ack within {:?}", self.timeout)),
        };

        self.metrics
            .notifications_failed
            .with_label_values(&[queue.as_str(), reason.0])
            .inc();
        tracing::warn!(
            order_id = %notification.order_id,
            queue = %queue,
            reason = %reason.1,
            "Status change not published"
        );

        Err(NotifyError::Transient {
            queue,
            reason: reason.1,
        })
    }
}
