use anyhow::{Context, Result};
use gql_fanout::config::{load_config_or_default, ServerConfig};
use gql_fanout::demo;
use gql_fanout::engine::SchemaRegistry;
use gql_fanout::server::{RunningServer, ServerBuilder, StartupError};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gql_fanout=info".into()),
        )
        .init();

    info!("gql-fanout starting...");

    let config_path = std::env::var("FANOUT_CONFIG").unwrap_or_else(|_| "fanout.toml".to_string());
    let config = load_config_or_default(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let schemas = SchemaRegistry::new(config.subscriptions.default_schema.clone())
        .with_schema("default", Arc::new(demo::build_executor()));
    info!(schemas = ?schemas.names(), default = %config.subscriptions.default_schema, "Schemas registered");

    let server = match start(&schemas, config.server.clone()).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return Err(e.into());
        }
    };

    info!(addr = %server.local_addr(), "gql-fanout ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    server.shutdown().await;
    Ok(())
}

async fn start(schemas: &SchemaRegistry, config: ServerConfig) -> Result<RunningServer, StartupError> {
    ServerBuilder::from_registry(schemas, config)?
        .filters(demo::filters())
        .bind()
        .await
}
