//! Application state.

use std::sync::Arc;

use architect_core::BroadcastBroker;
use architect_scheduler::BuilderRegistry;
use sqlx::PgPool;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BuilderRegistry>,
    pub broker: BroadcastBroker,
    /// Present when builds are stored in PostgreSQL.
    pub pool: Option<PgPool>,
    pub page_size: usize,
}

impl AppState {
    pub fn new(registry: Arc<BuilderRegistry>, broker: BroadcastBroker, page_size: usize) -> Self {
        Self {
            registry,
            broker,
            pool: None,
            page_size,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }
}
