pub mod collab;
pub mod compiler;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod result;
pub mod safety;
pub mod schema;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod trace;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the planq service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
