// ============================================================================
// Consumers - idempotent processing of status change notifications
// ============================================================================

mod consumer;
mod dlq;
mod ledger;
mod runner;

pub use consumer::{LoggingEffect, StatusConsumer};
pub use dlq::{DeadLetterSink, InMemoryDeadLetters, ScyllaDeadLetterSink};
pub use ledger::{InMemoryLedger, ProcessedLedger, RedisLedger};
pub use runner::ConsumerRunner;
