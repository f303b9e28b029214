use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use sha3::{Digest, Sha3_256};
use tokio::sync::Mutex;
use uuid::{Builder, Uuid};

// ============================================================================
// Dead Letter Sink
// ============================================================================
//
// Messages a consumer can never process (undecodable, misrouted, permanent
// effect failures, or transient failures past the retry limit) are stored
// here for manual intervention, then acknowledged.
//
// A letter's id is derived from its queue and message id, so a message that
// is delivered again after being dead-lettered overwrites its own row.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: Uuid,
    pub queue: String,
    pub message_id: String,
    pub payload: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(queue: &str, message_id: &str, payload: &str, error_message: &str) -> Self {
        Self {
            id: letter_id(queue, message_id),
            queue: queue.to_string(),
            message_id: message_id.to_string(),
            payload: payload.to_string(),
            error_message: error_message.to_string(),
            failed_at: Utc::now(),
        }
    }
}

/// First 16 bytes of SHA3-256 over `queue/message_id`, as a version 8 UUID.
fn letter_id(queue: &str, message_id: &str) -> Uuid {
    let digest = Sha3_256::new()
        .chain_update(queue.as_bytes())
        .chain_update(b"/")
        .chain_update(message_id.as_bytes())
        .finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Builder::from_custom_bytes(bytes).into_uuid()
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Dead-letter sink unavailable: {0}")]
pub struct DeadLetterError(pub String);

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn store(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

/// Writes to the `dead_letter_queue` table.
pub struct ScyllaDeadLetterSink {
    session: Arc<Session>,
}

impl ScyllaDeadLetterSink {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl DeadLetterSink for ScyllaDeadLetterSink {
    async fn store(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        tracing::error!(
            id = %letter.id,
            queue = %letter.queue,
            message_id = %letter.message_id,
            error = %letter.error_message,
            "💀 Adding message to Dead Letter Queue"
        );

        self.session
            .query_unpaged(
                "INSERT INTO dead_letter_queue (
                    id, queue, message_id, payload, error_message, failed_at
                ) VALUES (?, ?, ?, ?, ?, ?)",
                (
                    letter.id,
                    &letter.queue,
                    &letter.message_id,
                    &letter.payload,
                    &letter.error_message,
                    letter.failed_at,
                ),
            )
            .await
            .map_err(|e| DeadLetterError(format!("Failed to insert into DLQ: {}", e)))?;

        tracing::info!(id = %letter.id, "Message successfully stored in DLQ");
        Ok(())
    }
}

/// Keeps dead letters in memory, one per id; a later letter for the same
/// message replaces the earlier one.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn store(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        tracing::error!(
            queue = %letter.queue,
            message_id = %letter.message_id,
            error = %letter.error_message,
            "💀 Dead-lettered message"
        );
        let mut letters = self.letters.lock().await;
        match letters.iter_mut().find(|stored| stored.id == letter.id) {
            Some(stored) => *stored = letter,
            None => letters.push(letter),
        }
        Ok(())
    }
}
