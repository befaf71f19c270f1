//! HTTP surface for the Lagrum QA engine.

pub mod http;
pub mod state;

pub use http::create_router;
pub use state::AppState;
