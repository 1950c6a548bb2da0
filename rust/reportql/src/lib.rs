pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod pagination;
pub mod query;
pub mod server;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod time;

use crate::{config::AppConfig, server::Server};

/// Starts the reporting service from `REPORTQL_*` environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
