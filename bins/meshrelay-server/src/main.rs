//! MeshRelay Server
//!
//! Runs the relay data plane on its own: peers obtain stream handles
//! through the surrounding control plane and meet here over plain TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use meshrelay_core::{RelayConfig, RelayManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// MeshRelay - rendezvous relay for peers without a direct path
#[derive(Parser)]
#[command(name = "meshrelay-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TCP address for the relay data plane
    #[arg(short, long, default_value = "0.0.0.0:24002")]
    listen: SocketAddr,

    /// Endpoint advertised to peers (defaults to the bound address)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Default rendezvous TTL in seconds
    #[arg(short, long, default_value = "60")]
    ttl_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = RelayConfig {
        listen_addr: cli.listen,
        endpoint: cli.endpoint,
        default_ttl: Duration::from_secs(cli.ttl_secs),
        ..Default::default()
    };
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    let manager = Arc::new(RelayManager::new(config));
    let cancel = CancellationToken::new();
    manager.start(cancel.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    manager.stop().await;
    Ok(())
}
