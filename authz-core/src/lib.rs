//! authz-core: Shared infrastructure for the authorization server.
pub mod breaker;
pub mod error;
pub mod observability;
pub mod retry;

pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
