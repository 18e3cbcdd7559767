//! Application state.

use conveyor_scheduler::{ExecutionService, PipelineRuntime};
use conveyor_store::Store;
use std::sync::Arc;

use crate::config::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub executions: Arc<ExecutionService>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Store, runtime: Arc<dyn PipelineRuntime>, config: Config) -> Self {
        let executions = ExecutionService::new(
            store.clone(),
            runtime,
            config.max_in_flight,
            &config.allowed_drivers.default_dsn(),
        );
        Self {
            store,
            executions,
            config: Arc::new(config),
        }
    }
}
