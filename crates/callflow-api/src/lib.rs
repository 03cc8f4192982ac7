//! Callflow API crate - axum HTTP server for provider webhooks, campaign
//! management routes and the SSE event stream.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod webhooks;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
