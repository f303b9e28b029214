// ============================================================================
// Order Domain - Business Logic for Orders
// ============================================================================
//
// - Value objects (Order, OrderStatus)
// - Commands (StatusChange parsed from intake requests)
// - Errors (TransitionRejection, MalformedRequest)
// - Transition validation
// - Status change notifications and their dedupe keys
//
// Nothing here performs I/O.
//
// ============================================================================

pub mod value_objects;
pub mod commands;
pub mod errors;
pub mod transitions;
pub mod notification;

pub use value_objects::*;
pub use commands::*;
pub use errors::*;
pub use transitions::validate;
pub use notification::*;
