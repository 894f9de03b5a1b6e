pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod rate_limit;
pub mod repository;
pub mod schema;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod validation;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the fact inventory service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
