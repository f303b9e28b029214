// ============================================================================
// Order Store - key-value persistence with conditional writes
// ============================================================================
//
// The conditional write is the only concurrency control for orders: a write
// names the version it was computed from and the store refuses it atomically
// when that version is no longer current.
//
// ============================================================================

mod memory;
mod scylla_store;

use async_trait::async_trait;

use crate::domain::order::Order;

pub use self::memory::InMemoryOrderStore;
pub use self::scylla_store::{connect_session, ScyllaOrderStore};

/// Expected version for an order that must not exist yet.
pub const NEW_ORDER: i64 = 0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Version conflict on order {order_id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        order_id: String,
        expected: i64,
        actual: Option<i64>,
    },

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Order store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError>;

    /// Write `order` if the stored version equals `expected_version`
    /// (`NEW_ORDER` meaning absent). Returns the order as stored, with
    /// `version = expected_version + 1`.
    async fn create_or_update(
        &self,
        order: &Order,
        expected_version: i64,
    ) -> Result<Order, StoreError>;
}
