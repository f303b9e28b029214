use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

// ============================================================================
// Processed-key ledger
// ============================================================================
//
// Two markers per dedupe key:
//   in_progress  set-if-absent before the effect runs, expires after a short
//                lease so a worker that dies mid-effect does not hold the key
//   done         written once the effect succeeded, kept for the retention TTL
//
// Only `done` makes a redelivery a no-op. A redelivery that finds a live
// `in_progress` marker must come back later.
//
// ============================================================================

const IN_PROGRESS: &str = "in_progress";
const DONE: &str = "done";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Processed-key ledger unavailable: {0}")]
pub struct LedgerError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// This call holds the lease and should run the effect.
    Claimed,
    /// Another delivery holds an unexpired lease.
    InProgress,
    Done,
}

#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    /// Take the `in_progress` lease on `key` unless it is leased or done.
    async fn begin(&self, key: &str) -> Result<ClaimState, LedgerError>;

    /// Promote `key` to `done` for the retention TTL.
    async fn complete(&self, key: &str) -> Result<(), LedgerError>;

    /// Drop an `in_progress` lease so the key can be claimed again. A `done`
    /// marker is left alone.
    async fn release(&self, key: &str) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    mark: Mark,
    expires_at: Instant,
}

/// Ledger kept in process memory.
#[derive(Clone)]
pub struct InMemoryLedger {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    retention: Duration,
    lease: Duration,
}

impl InMemoryLedger {
    pub fn new(retention: Duration, lease: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            retention,
            lease,
        }
    }

    #[cfg(test)]
    pub async fn state(&self, key: &str) -> Option<ClaimState> {
        self.entries
            .lock()
            .await
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| match entry.mark {
                Mark::InProgress => ClaimState::InProgress,
                Mark::Done => ClaimState::Done,
            })
    }
}

#[async_trait]
impl ProcessedLedger for InMemoryLedger {
    async fn begin(&self, key: &str) -> Result<ClaimState, LedgerError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        match entries.get(key).map(|entry| entry.mark) {
            Some(Mark::Done) => Ok(ClaimState::Done),
            Some(Mark::InProgress) => Ok(ClaimState::InProgress),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        mark: Mark::InProgress,
                        expires_at: now + self.lease,
                    },
                );
                Ok(ClaimState::Claimed)
            }
        }
    }

    async fn complete(&self, key: &str) -> Result<(), LedgerError> {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                mark: Mark::Done,
                expires_at: Instant::now() + self.retention,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|entry| entry.mark == Mark::InProgress) {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Redis-backed ledger. The lease is `SET key in_progress NX PX lease`,
/// completion overwrites it with `SET key done EX ttl`.
#[derive(Clone)]
pub struct RedisLedger {
    connection: MultiplexedConnection,
    prefix: String,
    ttl_secs: u64,
    lease_ms: u64,
}

// Delete only while the key still holds the lease marker.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl RedisLedger {
    pub async fn connect(
        url: &str,
        prefix: &str,
        retention: Duration,
        lease: Duration,
    ) -> Result<Self, LedgerError> {
        let client = redis::Client::open(url)
            .map_err(|e| LedgerError(format!("Failed to create Redis client: {}", e)))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LedgerError(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!(
            prefix = %prefix,
            ttl_secs = retention.as_secs(),
            lease_ms = lease.as_millis() as u64,
            "Processed-key ledger connected to Redis"
        );

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            ttl_secs: retention.as_secs().max(1),
            lease_ms: (lease.as_millis() as u64).max(1),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl ProcessedLedger for RedisLedger {
    async fn begin(&self, key: &str) -> Result<ClaimState, LedgerError> {
        let mut conn = self.connection.clone();
        let key = self.key(key);

        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(IN_PROGRESS)
            .arg("NX")
            .arg("PX")
            .arg(self.lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LedgerError(format!("Redis SET NX failed: {}", e)))?;

        if reply.is_some() {
            return Ok(ClaimState::Claimed);
        }

        let current: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| LedgerError(format!("Redis GET failed: {}", e)))?;

        // A lease that lapsed between the two calls reads as in progress;
        // the next attempt claims it.
        Ok(match current.as_deref() {
            Some(DONE) => ClaimState::Done,
            _ => ClaimState::InProgress,
        })
    }

    async fn complete(&self, key: &str) -> Result<(), LedgerError> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(DONE)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| LedgerError(format!("Redis SET failed: {}", e)))
    }

    async fn release(&self, key: &str) -> Result<(), LedgerError> {
        let mut conn = self.connection.clone();
        redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(key))
            .arg(IN_PROGRESS)
            .invoke_async::<i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| LedgerError(format!("Redis lease release failed: {}", e)))
    }
}
