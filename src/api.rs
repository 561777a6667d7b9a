//! HTTP API

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::db::Database;
use crate::orchestrator::{InMemoryPendingStore, ProductionOrchestrator};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub pending: Arc<InMemoryPendingStore>,
    pub orchestrator: Arc<ProductionOrchestrator>,
}

impl AppState {
    pub fn new(
        db: Database,
        pending: Arc<InMemoryPendingStore>,
        orchestrator: Arc<ProductionOrchestrator>,
    ) -> Self {
        Self {
            db,
            pending,
            orchestrator,
        }
    }
}
