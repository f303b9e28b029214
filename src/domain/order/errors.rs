use super::value_objects::OrderStatus;

// ============================================================================
// Transition Rejections - user-fixable business rule violations
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionRejection {
    #[error("Order must be created with status 'received', got '{0}'")]
    InvalidInitialStatus(OrderStatus),

    #[error("Order is already '{0}'")]
    SameStatus(OrderStatus),

    #[error("Order in terminal status '{0}' cannot change")]
    TerminalStatus(OrderStatus),

    #[error("Cannot move order from '{from}' to '{to}'")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error("deliveryDate is required when completing an order")]
    MissingDeliveryDate,

    #[error("reasonForCancellation is required when canceling an order")]
    MissingCancellationReason,

    #[error("deliveryDate can only be set when the order becomes completed")]
    UnexpectedDeliveryDate,

    #[error("reasonForCancellation can only be set when the order becomes canceled")]
    UnexpectedCancellationReason,

    #[error("description cannot be changed after creation")]
    DescriptionImmutable,

    #[error("registerDate cannot be changed after creation")]
    RegisterDateImmutable,
}

/// Intake payload that cannot be turned into a status change.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct MalformedRequest(pub String);

impl MalformedRequest {
    pub fn missing(field: &str) -> Self {
        Self(format!("Missing required field: {}", field))
    }
}
