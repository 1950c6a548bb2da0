use crate::{config::AppConfig, query::QueryEngine};
use std::sync::Arc;

/// Shared handler state: the config for auth checks and the engine that runs reports.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub query: QueryEngine,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, query: QueryEngine) -> Self {
        Self { config, query }
    }
}
