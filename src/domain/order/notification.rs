use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use super::value_objects::{Order, OrderStatus};

// ============================================================================
// Status Change Notification - wire message published per status queue
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeNotification {
    pub order_id: String,
    /// `None` for the notification emitted on creation.
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub dedupe_key: String,
}

impl StatusChangeNotification {
    /// Notification for a freshly stored order.
    pub fn for_write(from_status: Option<OrderStatus>, stored: &Order) -> Self {
        Self {
            order_id: stored.order_id.clone(),
            from_status,
            to_status: stored.status,
            dedupe_key: dedupe_key(&stored.order_id, stored.version),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Hex SHA3-256 of `"{order_id}:{version}"`.
pub fn dedupe_key(order_id: &str, version: i64) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(order_id.as_bytes());
    hasher.update(b":");
    hasher.update(version.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
