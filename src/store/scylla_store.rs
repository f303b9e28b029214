use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::response::query_result::QueryResult;
use scylla::value::{CqlValue, Row};

use super::{OrderStore, StoreError, NEW_ORDER};
use crate::config::StoreConfig;
use crate::domain::order::{Order, OrderStatus};

// ============================================================================
// ScyllaDB Order Store
// ============================================================================
//
// Conditional writes are lightweight transactions:
// - creation:  INSERT ... IF NOT EXISTS
// - update:    UPDATE ... IF version = ?
//
// Both return an `[applied]` column; when a write is not applied the row also
// carries the current `version` (null when the row does not exist).
//
// ============================================================================

const SELECT_ORDER: &str = "SELECT order_id, status, description, register_date, \
     delivery_date, reason_for_cancellation, version FROM orders WHERE order_id = ?";

const INSERT_ORDER: &str = "INSERT INTO orders (order_id, status, description, register_date, \
     delivery_date, reason_for_cancellation, version) VALUES (?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS";

const UPDATE_ORDER: &str = "UPDATE orders SET status = ?, delivery_date = ?, \
     reason_for_cancellation = ?, version = ? WHERE order_id = ? IF version = ?";

type OrderRow = (
    String,
    String,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<String>,
    i64,
);

/// Open a session against `config.known_nodes` and select the keyspace,
/// creating keyspace and tables when missing.
pub async fn connect_session(config: &StoreConfig) -> anyhow::Result<Arc<Session>> {
    tracing::info!(nodes = ?config.known_nodes, "Connecting to ScyllaDB...");

    let mut builder = SessionBuilder::new();
    for node in &config.known_nodes {
        builder = builder.known_node(node);
    }
    let session: Session = builder.build().await?;

    session
        .query_unpaged(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                 {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                config.keyspace
            ),
            &[],
        )
        .await?;
    session.use_keyspace(&config.keyspace, false).await?;

    session
        .query_unpaged(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id text PRIMARY KEY,
                status text,
                description text,
                register_date timestamp,
                delivery_date timestamp,
                reason_for_cancellation text,
                version bigint
            )",
            &[],
        )
        .await?;

    session
        .query_unpaged(
            "CREATE TABLE IF NOT EXISTS dead_letter_queue (
                id uuid PRIMARY KEY,
                queue text,
                message_id text,
                payload text,
                error_message text,
                failed_at timestamp
            )",
            &[],
        )
        .await?;

    Ok(Arc::new(session))
}

pub struct ScyllaOrderStore {
    session: Arc<Session>,
}

impl ScyllaOrderStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Read `[applied]` and, when present, the current `version` of an LWT result.
fn lwt_outcome(result: QueryResult) -> Result<(bool, Option<i64>), StoreError> {
    let rows = result.into_rows_result().map_err(unavailable)?;

    let version_idx = rows
        .column_specs()
        .iter()
        .position(|spec| spec.name() == "version");

    let row = rows
        .maybe_first_row::<Row>()
        .map_err(unavailable)?
        .ok_or_else(|| unavailable("conditional write returned no rows"))?;

    let applied = matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true))));
    let version = version_idx
        .and_then(|idx| row.columns.get(idx).cloned().flatten())
        .and_then(|value| match value {
            CqlValue::BigInt(v) => Some(v),
            _ => None,
        });

    Ok((applied, version))
}

#[async_trait]
impl OrderStore for ScyllaOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let result = self
            .session
            .query_unpaged(SELECT_ORDER, (order_id,))
            .await
            .map_err(unavailable)?;

        let rows = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(None),
        };

        let Some(row) = rows.maybe_first_row::<OrderRow>().map_err(unavailable)? else {
            return Ok(None);
        };

        let (order_id, status, description, register_date, delivery_date, reason, version) = row;
        let status = status
            .parse::<OrderStatus>()
            .map_err(|e| unavailable(format!("corrupt status for order {}: {}", order_id, e)))?;

        Ok(Some(Order {
            order_id,
            status,
            description,
            register_date,
            delivery_date,
            reason_for_cancellation: reason,
            version,
        }))
    }

    async fn create_or_update(
        &self,
        order: &Order,
        expected_version: i64,
    ) -> Result<Order, StoreError> {
        let new_version = expected_version + 1;

        let outcome = if expected_version == NEW_ORDER {
            self.session
                .query_unpaged(
                    INSERT_ORDER,
                    (
                        &order.order_id,
                        order.status.as_str(),
                        &order.description,
                        order.register_date,
                        order.delivery_date,
                        &order.reason_for_cancellation,
                        new_version,
                    ),
                )
                .await
        } else {
            self.session
                .query_unpaged(
                    UPDATE_ORDER,
                    (
                        order.status.as_str(),
                        order.delivery_date,
                        &order.reason_for_cancellation,
                        new_version,
                        &order.order_id,
                        expected_version,
                    ),
                )
                .await
        };

        let (applied, actual) = lwt_outcome(outcome.map_err(unavailable)?)?;

        if !applied {
            if expected_version != NEW_ORDER && actual.is_none() {
                return Err(StoreError::NotFound(order.order_id.clone()));
            }
            tracing::debug!(
                order_id = %order.order_id,
                expected_version,
                actual_version = ?actual,
                "Conditional write not applied"
            );
            return Err(StoreError::VersionConflict {
                order_id: order.order_id.clone(),
                expected: expected_version,
                actual,
            });
        }

        tracing::info!(
            order_id = %order.order_id,
            status = %order.status,
            version = new_version,
            "✅ Order written to ScyllaDB"
        );

        Ok(Order {
            version: new_version,
            ..order.clone()
        })
    }
}
