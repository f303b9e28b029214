// Private module declaration
mod server;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub use server::configure;

// ============================================================================
// Metrics - Prometheus metrics for the order pipeline
// ============================================================================
//
// - Intake outcomes and latency
// - Conditional write conflicts
// - Notification publishing per queue
// - Consumer outcomes per status and dead-lettering
// - Publisher circuit breaker state
//
// Scraped via GET /metrics.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Intake
    pub intake_requests: IntCounterVec,
    pub intake_duration: Histogram,
    pub store_conflicts: IntCounter,

    // Notifier
    pub notifications_published: IntCounterVec,
    pub notifications_failed: IntCounterVec,
    pub circuit_breaker_state: IntGauge,

    // Consumers
    pub consumer_messages: IntCounterVec,
    pub dead_lettered: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let intake_requests = IntCounterVec::new(
            Opts::new("intake_requests_total", "Intake requests by outcome kind"),
            &["outcome"],
        )?;
        registry.register(Box::new(intake_requests.clone()))?;

        let intake_duration = Histogram::with_opts(
            HistogramOpts::new("intake_duration_seconds", "Intake request handling duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(intake_duration.clone()))?;

        let store_conflicts = IntCounter::new(
            "store_version_conflicts_total",
            "Conditional writes refused because of a stale version",
        )?;
        registry.register(Box::new(store_conflicts.clone()))?;

        let notifications_published = IntCounterVec::new(
            Opts::new("notifications_published_total", "Notifications published per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(notifications_published.clone()))?;

        let notifications_failed = IntCounterVec::new(
            Opts::new("notifications_failed_total", "Notifications that could not be published"),
            &["queue", "reason"],
        )?;
        registry.register(Box::new(notifications_failed.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "publisher_circuit_breaker_state",
            "Publisher circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let consumer_messages = IntCounterVec::new(
            Opts::new("consumer_messages_total", "Delivered notifications by status and outcome"),
            &["status", "outcome"],
        )?;
        registry.register(Box::new(consumer_messages.clone()))?;

        let dead_lettered = IntCounterVec::new(
            Opts::new("dead_lettered_messages_total", "Messages routed to the dead-letter sink"),
            &["queue"],
        )?;
        registry.register(Box::new(dead_lettered.clone()))?;

        Ok(Self {
            registry,
            intake_requests,
            intake_duration,
            store_conflicts,
            notifications_published,
            notifications_failed,
            circuit_breaker_state,
            consumer_messages,
            dead_lettered,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_all_metrics_registered() {
        let metrics = Metrics::new().unwrap();

        metrics.intake_requests.with_label_values(&["ok"]).inc();
        metrics.notifications_published.with_label_values(&["received-queue"]).inc();
        metrics.notifications_failed.with_label_values(&["received-queue", "transient"]).inc();
        metrics.consumer_messages.with_label_values(&["received", "processed"]).inc();
        metrics.dead_lettered.with_label_values(&["received-queue"]).inc();
        metrics.store_conflicts.inc();
        metrics.intake_duration.observe(0.01);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry().gather(), &mut buffer)
            .unwrap();
        let exposition = String::from_utf8(buffer).unwrap();

        for expected in [
            "intake_requests_total",
            "intake_duration_seconds",
            "store_version_conflicts_total",
            "notifications_published_total",
            "notifications_failed_total",
            "publisher_circuit_breaker_state",
            "consumer_messages_total",
            "dead_lettered_messages_total",
        ] {
            assert!(exposition.contains(expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.store_conflicts.inc();
        assert_eq!(a.store_conflicts.get(), 1);
        assert_eq!(b.store_conflicts.get(), 0);
    }
}
