//! fanout-publish - inject one event into a running gql-fanout server.

use anyhow::{Context, Result};
use clap::Parser;
use gql_fanout::config::PublisherConfig;
use gql_fanout::publisher::BroadcastPublisher;
use serde_json::Value;
use tracing::info;

#[derive(Parser)]
#[command(name = "fanout-publish")]
#[command(version)]
#[command(about = "Publish one event to a gql-fanout server", long_about = None)]
struct Cli {
    /// Subscription field the event is for (e.g. messageAdded)
    subscription: String,

    /// Event payload as JSON
    #[arg(default_value = "{}")]
    payload: String,

    /// Override the endpoint port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_publish=info,gql_fanout=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let payload: Value = serde_json::from_str(&cli.payload)
        .with_context(|| format!("Payload is not valid JSON: {}", cli.payload))?;

    let mut config = PublisherConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let publisher = BroadcastPublisher::new(&config);
    info!(
        endpoint = %config.endpoint,
        port = config.port,
        subscription = %cli.subscription,
        "Publishing event"
    );

    publisher
        .try_publish(&cli.subscription, payload)
        .await
        .context("Event was not delivered")?;

    info!("Event delivered");
    Ok(())
}
