// ============================================================================
// Intake - create-or-update requests for orders
// ============================================================================

mod handler;
mod http;
mod response;

pub use handler::IntakeHandler;
pub use http::configure;
