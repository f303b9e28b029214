use crate::routing::StatusRegistry;

use super::commands::TransitionPayload;
use super::errors::TransitionRejection;
use super::value_objects::OrderStatus;

// ============================================================================
// Transition Validator
// ============================================================================

/// Check a proposed move from `current` to `target`.
///
/// Pure: reads only the registry's edge table and the request payload.
pub fn validate(
    registry: &StatusRegistry,
    current: Option<OrderStatus>,
    target: OrderStatus,
    payload: &TransitionPayload,
) -> Result<(), TransitionRejection> {
    match current {
        None if !registry.accepts_creation(target) => {
            return Err(TransitionRejection::InvalidInitialStatus(target));
        }
        Some(from) if from == target => {
            return Err(TransitionRejection::SameStatus(from));
        }
        Some(from) if from.is_terminal() => {
            return Err(TransitionRejection::TerminalStatus(from));
        }
        Some(from) if !registry.is_legal(Some(from), target) => {
            return Err(TransitionRejection::IllegalTransition { from, to: target });
        }
        _ => {}
    }

    match target {
        OrderStatus::Completed if payload.delivery_date.is_none() => {
            return Err(TransitionRejection::MissingDeliveryDate);
        }
        OrderStatus::Canceled if payload.reason_for_cancellation.is_none() => {
            return Err(TransitionRejection::MissingCancellationReason);
        }
        _ => {}
    }

    if target != OrderStatus::Completed && payload.delivery_date.is_some() {
        return Err(TransitionRejection::UnexpectedDeliveryDate);
    }

    if target != OrderStatus::Canceled && payload.reason_for_cancellation.is_some() {
        return Err(TransitionRejection::UnexpectedCancellationReason);
    }

    Ok(())
}
