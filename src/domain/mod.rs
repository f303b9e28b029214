// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Order value objects, transition rules and notification messages. This layer
// is independent of storage, queues and HTTP.
//
// ============================================================================

pub mod order;
