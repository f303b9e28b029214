use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::errors::MalformedRequest;
use super::value_objects::{parse_timestamp, OrderStatus};

// ============================================================================
// Order Commands - parsed intake requests
// ============================================================================

const INVALID_JSON: &str = "Invalid JSON in request body.";

/// Status-dependent fields checked by the transition validator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPayload {
    pub delivery_date: Option<DateTime<Utc>>,
    pub reason_for_cancellation: Option<String>,
}

/// A create-or-update request after parsing and type checking.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub order_id: String,
    pub target: OrderStatus,
    pub description: Option<String>,
    pub register_date: Option<DateTime<Utc>>,
    pub payload: TransitionPayload,
}

impl StatusChange {
    /// Parse a raw JSON request body. Bytes that are not UTF-8 are invalid JSON.
    pub fn from_json(body: impl AsRef<[u8]>) -> Result<Self, MalformedRequest> {
        let value: Value = serde_json::from_slice(body.as_ref())
            .map_err(|_| MalformedRequest(INVALID_JSON.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, MalformedRequest> {
        let Value::Object(fields) = value else {
            return Err(MalformedRequest(INVALID_JSON.to_string()));
        };

        let order_id = required_string(&fields, "orderId")?;
        let status = required_string(&fields, "status")?;
        let target = status.parse::<OrderStatus>().map_err(MalformedRequest)?;

        let register_date = optional_string(&fields, "registerDate")?
            .map(|raw| parse_timestamp(&raw))
            .transpose()
            .map_err(|e| MalformedRequest(format!("registerDate: {}", e)))?;

        let delivery_date = optional_string(&fields, "deliveryDate")?
            .map(|raw| parse_timestamp(&raw))
            .transpose()
            .map_err(|e| MalformedRequest(format!("deliveryDate: {}", e)))?;

        Ok(Self {
            order_id,
            target,
            description: optional_string(&fields, "description")?,
            register_date,
            payload: TransitionPayload {
                delivery_date,
                reason_for_cancellation: optional_string(&fields, "reasonForCancellation")?,
            },
        })
    }
}

fn required_string(fields: &Map<String, Value>, name: &str) -> Result<String, MalformedRequest> {
    optional_string(fields, name)?.ok_or_else(|| MalformedRequest::missing(name))
}

/// Null and blank strings count as absent.
fn optional_string(
    fields: &Map<String, Value>,
    name: &str,
) -> Result<Option<String>, MalformedRequest> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(MalformedRequest(format!("Field '{}' must be a string", name))),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
