use serde::Serialize;

use crate::domain::order::{MalformedRequest, Order, TransitionRejection};

// ============================================================================
// Intake outcomes and the error taxonomy surfaced to callers
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// Persisted and published.
    Accepted(Order),
    /// Persisted, but the notification could not be published. Reconciliation
    /// re-notifies from the store.
    DegradedSuccess { order: Order, reason: String },
}

impl IntakeOutcome {
    #[cfg(test)]
    pub fn order(&self) -> &Order {
        match self {
            Self::Accepted(order) | Self::DegradedSuccess { order, .. } => order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntakeError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Rejected(#[from] TransitionRejection),

    #[error("Order {order_id} was modified concurrently, retry the request")]
    Conflict { order_id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Temporarily unavailable: {0}")]
    Transient(String),
}

impl From<MalformedRequest> for IntakeError {
    fn from(e: MalformedRequest) -> Self {
        IntakeError::BadRequest(e.0)
    }
}

impl IntakeError {
    /// Stable identifier exposed to callers and used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Rejected(_) => "rejected",
            Self::Conflict { .. } => "conflict",
            Self::Configuration(_) => "configuration_error",
            Self::Transient(_) => "transient_failure",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::Rejected(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict { .. } => 409,
            Self::Configuration(_) => 500,
            Self::Transient(_) => 503,
        }
    }

    #[cfg(test)]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeResponse {
    pub status_code: u16,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl IntakeResponse {
    pub fn from_result(result: &Result<IntakeOutcome, IntakeError>, order_id: Option<&str>) -> Self {
        match result {
            Ok(IntakeOutcome::Accepted(order)) => Self {
                status_code: 200,
                body: ResponseBody {
                    message: Some("Order processed successfully".to_string()),
                    order_id: Some(order.order_id.clone()),
                    version: Some(order.version),
                    ..Default::default()
                },
            },
            Ok(IntakeOutcome::DegradedSuccess { order, reason }) => Self {
                status_code: 202,
                body: ResponseBody {
                    message: Some(format!(
                        "Order saved; status notification delayed ({})",
                        reason
                    )),
                    kind: Some("degraded_success".to_string()),
                    order_id: Some(order.order_id.clone()),
                    version: Some(order.version),
                    ..Default::default()
                },
            },
            Err(e) => Self {
                status_code: e.status_code(),
                body: ResponseBody {
                    error: Some(e.to_string()),
                    kind: Some(e.kind().to_string()),
                    order_id: order_id.map(str::to_string),
                    ..Default::default()
                },
            },
        }
    }
}
