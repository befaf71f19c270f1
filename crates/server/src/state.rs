//! Application state.
//!
//! Shared across all handlers. The orchestrator and its children are process
//! singletons created once at startup; no per-request state is shared across
//! requests.

use std::sync::Arc;

use lagrum_agent::Orchestrator;
use lagrum_config::Settings;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(settings: Settings, orchestrator: Arc<Orchestrator>) -> Self {
        Self { settings: Arc::new(settings), orchestrator }
    }
}
