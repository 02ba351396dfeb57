//! Application State
//!
//! Shared state for the controller's HTTP API

use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::db::Database;
use crate::scheduler::SchedulerService;
use crate::store::MigrationStore;
use crate::worker::MigrationQueue;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ControllerConfig>,
    pub database: Arc<Database>,
    pub store: MigrationStore,
    pub queue: MigrationQueue,
    pub scheduler: Arc<SchedulerService>,
}
