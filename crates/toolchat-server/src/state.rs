//! Application State

use std::sync::Arc;

use toolchat_core::Orchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Turn processing, sessions and the provider behind them
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub const fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}
