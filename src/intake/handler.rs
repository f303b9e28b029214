use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use super::response::{IntakeError, IntakeOutcome, IntakeResponse};
use crate::domain::order::{
    validate, MalformedRequest, Order, OrderStatus, StatusChange, StatusChangeNotification,
    TransitionRejection,
};
use crate::messaging::{Notifier, NotifyError};
use crate::metrics::Metrics;
use crate::routing::StatusRegistry;
use crate::store::{OrderStore, StoreError, NEW_ORDER};

// ============================================================================
// Intake Handler
// ============================================================================
//
// Orchestrates: parse → read current → validate → conditional write → notify
//
// A version conflict is re-read and re-validated once; a second conflict is
// returned to the caller. Nothing is written when validation fails.
//
// ============================================================================

const MAX_WRITE_ATTEMPTS: u32 = 2;

pub struct IntakeHandler {
    registry: Arc<StatusRegistry>,
    store: Arc<dyn OrderStore>,
    notifier: Arc<Notifier>,
    store_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl IntakeHandler {
    pub fn new(
        registry: Arc<StatusRegistry>,
        store: Arc<dyn OrderStore>,
        notifier: Arc<Notifier>,
        store_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            store,
            notifier,
            store_timeout,
            metrics,
        }
    }

    /// Entry point for a raw JSON request body.
    pub async fn handle_json(&self, body: impl AsRef<[u8]>) -> IntakeResponse {
        match StatusChange::from_json(body) {
            Ok(change) => {
                let result = self.handle(change.clone()).await;
                IntakeResponse::from_result(&result, Some(&change.order_id))
            }
            Err(e) => self.malformed(e),
        }
    }

    /// Entry point for an already decoded request body.
    pub async fn handle_value(&self, body: serde_json::Value) -> IntakeResponse {
        match StatusChange::from_value(body) {
            Ok(change) => {
                let result = self.handle(change.clone()).await;
                IntakeResponse::from_result(&result, Some(&change.order_id))
            }
            Err(e) => self.malformed(e),
        }
    }

    fn malformed(&self, e: MalformedRequest) -> IntakeResponse {
        tracing::info!(error = %e, "Rejected malformed intake request");
        let result = Err(IntakeError::from(e));
        self.record(&result);
        IntakeResponse::from_result(&result, None)
    }

    pub async fn handle(&self, change: StatusChange) -> Result<IntakeOutcome, IntakeError> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        tracing::debug!(
            request_id = %request_id,
            order_id = %change.order_id,
            target = %change.target,
            "Handling intake request"
        );

        let result = self.apply(&change).await;

        self.metrics
            .intake_duration
            .observe(started.elapsed().as_secs_f64());
        self.record(&result);

        match &result {
            Ok(IntakeOutcome::Accepted(order)) => tracing::info!(
                request_id = %request_id,
                order_id = %order.order_id,
                status = %order.status,
                version = order.version,
                "✅ Order accepted"
            ),
            Ok(IntakeOutcome::DegradedSuccess { order, reason }) => tracing::warn!(
                request_id = %request_id,
                order_id = %order.order_id,
                status = %order.status,
                version = order.version,
                reason = %reason,
                "Order stored but notification pending reconciliation"
            ),
            Err(e) => tracing::info!(
                request_id = %request_id,
                order_id = %change.order_id,
                target = %change.target,
                kind = e.kind(),
                error = %e,
                "Intake request refused"
            ),
        }

        result
    }

    /// Read-only lookup used by the HTTP adapter.
    pub async fn get_order(&self, order_id: &str) -> Result<Order, IntakeError> {
        self.read(order_id)
            .await?
            .ok_or_else(|| IntakeError::NotFound(format!("Order not found: {}", order_id)))
    }

    fn record(&self, result: &Result<IntakeOutcome, IntakeError>) {
        let label = match result {
            Ok(IntakeOutcome::Accepted(_)) => "accepted",
            Ok(IntakeOutcome::DegradedSuccess { .. }) => "degraded_success",
            Err(e) => e.kind(),
        };
        self.metrics.intake_requests.with_label_values(&[label]).inc();
    }

    async fn apply(&self, change: &StatusChange) -> Result<IntakeOutcome, IntakeError> {
        // Refuse unroutable targets before anything is written.
        if self.registry.queue_for(change.target).is_none() {
            return Err(IntakeError::Configuration(format!(
                "No queue configured for status '{}'",
                change.target
            )));
        }

        let mut attempt = 1;
        let (previous, stored) = loop {
            let current = self.read(&change.order_id).await?;
            let (candidate, expected_version) = self.prepare(current.as_ref(), change)?;

            match self.write(&candidate, expected_version).await {
                Ok(stored) => break (current.map(|order| order.status), stored),
                Err(StoreError::VersionConflict { expected, actual, .. }) => {
                    self.metrics.store_conflicts.inc();

                    if attempt >= MAX_WRITE_ATTEMPTS {
                        return Err(IntakeError::Conflict {
                            order_id: change.order_id.clone(),
                        });
                    }

                    tracing::warn!(
                        order_id = %change.order_id,
                        expected_version = expected,
                        actual_version = ?actual,
                        "Version conflict, re-reading order"
                    );
                    attempt += 1;
                }
                Err(StoreError::NotFound(order_id)) => {
                    return Err(IntakeError::NotFound(format!("Order not found: {}", order_id)));
                }
                Err(StoreError::Unavailable(reason)) => {
                    return Err(IntakeError::Transient(reason));
                }
            }
        };

        let notification = StatusChangeNotification::for_write(previous, &stored);

        match self.notifier.publish(&notification).await {
            Ok(_) => Ok(IntakeOutcome::Accepted(stored)),
            Err(NotifyError::Transient { reason, .. }) => {
                Ok(IntakeOutcome::DegradedSuccess { order: stored, reason })
            }
            Err(e @ NotifyError::Unmapped(_)) => {
                tracing::error!(
                    order_id = %stored.order_id,
                    version = stored.version,
                    error = %e,
                    "Order stored but its status has no queue"
                );
                Err(IntakeError::Configuration(e.to_string()))
            }
        }
    }

    /// Build the record to write and the version it must replace.
    fn prepare(
        &self,
        current: Option<&Order>,
        change: &StatusChange,
    ) -> Result<(Order, i64), IntakeError> {
        let Some(existing) = current else {
            if change.target != OrderStatus::Received {
                return Err(IntakeError::NotFound(format!(
                    "Order not found: {}",
                    change.order_id
                )));
            }

            let description = change
                .description
                .clone()
                .ok_or_else(|| IntakeError::from(MalformedRequest::missing("description")))?;

            validate(&self.registry, None, change.target, &change.payload)?;

            let order = Order {
                order_id: change.order_id.clone(),
                status: change.target,
                description,
                register_date: change.register_date.unwrap_or_else(Utc::now),
                delivery_date: change.payload.delivery_date,
                reason_for_cancellation: change.payload.reason_for_cancellation.clone(),
                version: NEW_ORDER,
            };
            return Ok((order, NEW_ORDER));
        };

        validate(&self.registry, Some(existing.status), change.target, &change.payload)?;

        if matches!(&change.description, Some(d) if *d != existing.description) {
            return Err(TransitionRejection::DescriptionImmutable.into());
        }
        if matches!(change.register_date, Some(d) if d != existing.register_date) {
            return Err(TransitionRejection::RegisterDateImmutable.into());
        }

        let order = Order {
            status: change.target,
            delivery_date: change.payload.delivery_date.or(existing.delivery_date),
            reason_for_cancellation: change
                .payload
                .reason_for_cancellation
                .clone()
                .or_else(|| existing.reason_for_cancellation.clone()),
            ..existing.clone()
        };
        Ok((order, existing.version))
    }

    async fn read(&self, order_id: &str) -> Result<Option<Order>, IntakeError> {
        match tokio::time::timeout(self.store_timeout, self.store.get(order_id)).await {
            Ok(Ok(order)) => Ok(order),
            Ok(Err(e)) => Err(IntakeError::Transient(e.to_string())),
            Err(_) => Err(IntakeError::Transient(format!(
                "order store read timed out after {:?}",
                self.store_timeout
            ))),
        }
    }

    /// A write that times out may still land; the version seen by the next
    /// read tells the truth.
    async fn write(&self, order: &Order, expected_version: i64) -> Result<Order, StoreError> {
        tokio::time::timeout(
            self.store_timeout,
            self.store.create_or_update(order, expected_version),
        )
        .await
        .unwrap_or_else(|_| {
            Err(StoreError::Unavailable(format!(
                "order store write timed out after {:?}",
                self.store_timeout
            )))
        })
    }
}
