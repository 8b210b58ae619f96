//! Shared application state for the API server.

use std::sync::Arc;
use std::time::SystemTime;

use crate::db::repository::Repository;
use crate::scheduler::Scheduler;
use crate::valuation::ValuationEngine;

/// Shared state handed to every API handler.
#[derive(Clone)]
pub struct AppState {
    /// Repository for database access.
    pub repository: Arc<Repository>,
    /// Valuation engine for TVL queries.
    pub valuation: Arc<ValuationEngine>,
    /// Scheduler, for the status and admin surfaces.
    pub scheduler: Arc<Scheduler>,
    /// Application start time for uptime tracking.
    pub start_time: SystemTime,
    /// Bearer token required by admin endpoints, when configured.
    pub admin_token: Option<String>,
}

impl AppState {
    /// Create the shared state.
    #[must_use]
    pub fn new(
        repository: Arc<Repository>,
        valuation: Arc<ValuationEngine>,
        scheduler: Arc<Scheduler>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            repository,
            valuation,
            scheduler,
            start_time: SystemTime::now(),
            admin_token,
        }
    }
}
