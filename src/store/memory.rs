//! In-memory order store, used for local runs and as the test double.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{OrderStore, StoreError, NEW_ORDER};
use crate::domain::order::Order;

/// Orders keyed by id. The version check and the write happen under one
/// write guard, which is what makes the conditional write atomic here.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<String, Order>>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().await.get(order_id).cloned())
    }

    async fn create_or_update(
        &self,
        order: &Order,
        expected_version: i64,
    ) -> Result<Order, StoreError> {
        let mut orders = self.orders.write().await;

        match orders.get(&order.order_id) {
            None if expected_version != NEW_ORDER => {
                return Err(StoreError::NotFound(order.order_id.clone()));
            }
            Some(existing) if existing.version != expected_version => {
                return Err(StoreError::VersionConflict {
                    order_id: order.order_id.clone(),
                    expected: expected_version,
                    actual: Some(existing.version),
                });
            }
            _ => {}
        }

        let stored = Order {
            version: expected_version + 1,
            ..order.clone()
        };
        orders.insert(stored.order_id.clone(), stored.clone());

        tracing::debug!(
            order_id = %stored.order_id,
            version = stored.version,
            "Stored order in memory"
        );

        Ok(stored)
    }
}
