// ============================================================================
// Routing - which queue receives which status, and which moves are legal
// ============================================================================

mod registry;

pub use registry::{QueueId, StatusRegistry};

#[cfg(test)]
pub(crate) use registry::test_registry;
