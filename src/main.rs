use actix_web::{web, App, HttpServer};
use scylla::client::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod consumers;
mod domain;
mod intake;
mod messaging;
mod metrics;
mod routing;
mod store;
mod utils;

use crate::config::{AppConfig, DeadLetterBackend, LedgerBackend, QueueBackend, StoreBackend};
use consumers::{
    ConsumerRunner, DeadLetterSink, InMemoryDeadLetters, InMemoryLedger, LoggingEffect,
    ProcessedLedger, RedisLedger, ScyllaDeadLetterSink, StatusConsumer,
};
use intake::IntakeHandler;
use messaging::{
    DeliverySource, InMemoryQueue, InMemorySource, Notifier, QueuePublisher, RedpandaClient,
    RedpandaSource,
};
use routing::StatusRegistry;
use store::{InMemoryOrderStore, OrderStore, ScyllaOrderStore};

const LEDGER_PREFIX: &str = "order-pipeline:processed";
const BREAKER_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO, overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,order_status_pipeline=debug")),
        )
        .init();

    tracing::info!("🚀 Starting order status pipeline");

    let config = AppConfig::load()?;
    let registry = Arc::new(StatusRegistry::from_config(&config.routing)?);

    // === 1. Metrics ===
    let metrics = Arc::new(metrics::Metrics::new()?);

    // === 2. ScyllaDB session, only when a backend needs it ===
    let needs_scylla = config.store.backend == StoreBackend::Scylla
        || config.dead_letter.backend == DeadLetterBackend::Scylla;
    let session: Option<Arc<Session>> = if needs_scylla {
        Some(store::connect_session(&config.store).await?)
    } else {
        None
    };

    // === 3. Order store ===
    let order_store: Arc<dyn OrderStore> = match (&config.store.backend, &session) {
        (StoreBackend::Scylla, Some(session)) => Arc::new(ScyllaOrderStore::new(session.clone())),
        _ => {
            tracing::warn!("Using in-memory order store; orders are lost on restart");
            Arc::new(InMemoryOrderStore::new())
        }
    };

    // === 4. Queues (publisher plus one source per routed status) ===
    let memory_queue = InMemoryQueue::new();
    let redpanda = match config.queue.backend {
        QueueBackend::Redpanda => Some(Arc::new(RedpandaClient::new(
            &config.queue.brokers,
            config.queue.publish_timeout(),
            (&config.circuit_breaker).into(),
        )?)),
        QueueBackend::Memory => None,
    };
    let publisher: Arc<dyn QueuePublisher> = match &redpanda {
        Some(client) => client.clone(),
        None => Arc::new(memory_queue.clone()),
    };

    if let Some(client) = redpanda.clone() {
        let gauge = metrics.circuit_breaker_state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BREAKER_SAMPLE_INTERVAL);
            loop {
                interval.tick().await;
                gauge.set(client.circuit_state().await.as_gauge());
            }
        });
    }

    // === 5. Consumer side: ledger, dead letters, runners ===
    let ledger: Arc<dyn ProcessedLedger> = match config.ledger.backend {
        LedgerBackend::Redis => Arc::new(
            RedisLedger::connect(
                &config.ledger.redis_url,
                LEDGER_PREFIX,
                config.ledger.retention(),
                config.ledger.lease(),
            )
            .await?,
        ),
        LedgerBackend::Memory => Arc::new(InMemoryLedger::new(
            config.ledger.retention(),
            config.ledger.lease(),
        )),
    };

    let dead_letters: Arc<dyn DeadLetterSink> = match (&config.dead_letter.backend, &session) {
        (DeadLetterBackend::Scylla, Some(session)) => {
            Arc::new(ScyllaDeadLetterSink::new(session.clone()))
        }
        _ => Arc::new(InMemoryDeadLetters::new()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut runners = Vec::new();

    for (status, queue) in registry.routed_statuses() {
        let source: Box<dyn DeliverySource> = match config.queue.backend {
            QueueBackend::Redpanda => Box::new(RedpandaSource::subscribe(
                &config.queue.brokers,
                &format!("{}-{}", config.queue.consumer_group, status),
                queue.clone(),
                config.queue.batch_size,
                config.queue.batch_linger(),
            )?),
            QueueBackend::Memory => Box::new(InMemorySource::new(
                memory_queue.clone(),
                queue.clone(),
                config.queue.batch_size,
                config.queue.batch_linger(),
            )),
        };

        let consumer = Arc::new(StatusConsumer::new(
            status,
            queue,
            ledger.clone(),
            dead_letters.clone(),
            Arc::new(LoggingEffect),
            metrics.clone(),
        ));

        let runner = ConsumerRunner::new(source, consumer, (&config.consumer_retry).into());
        runners.push(tokio::spawn(runner.run(shutdown_rx.clone())));
    }

    tracing::info!(consumers = runners.len(), "Consumer runners started");

    // === 6. Intake ===
    let notifier = Arc::new(Notifier::new(
        registry.clone(),
        publisher,
        config.queue.publish_timeout(),
        metrics.clone(),
    ));
    let handler = Arc::new(IntakeHandler::new(
        registry,
        order_store,
        notifier,
        config.store.timeout(),
        metrics.clone(),
    ));

    // === 7. HTTP server ===
    let bind = (config.server.host.clone(), config.server.port);
    tracing::info!(host = %bind.0, port = bind.1, "Starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(handler.clone()))
            .app_data(web::Data::new(metrics.clone()))
            .configure(intake::configure)
            .configure(metrics::configure)
    })
    .bind(bind)?
    .run()
    .await?;

    // === 8. Shutdown ===
    tracing::info!("HTTP server stopped, shutting down consumers");
    let _ = shutdown_tx.send(true);
    for result in futures_util::future::join_all(runners).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Consumer runner panicked");
        }
    }

    tracing::info!("👋 Shutdown complete");
    Ok(())
}
