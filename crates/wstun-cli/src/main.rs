//! wstun - multiplexed reverse-tunnel client

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wstun_client::{ClientConfig, TunnelClient};
use wstun_transport_websocket::WebSocketConnector;

/// Tunnel client - forward TCP connections through one multiplexed
/// WebSocket connection
#[derive(Parser, Debug)]
#[command(name = "wstun")]
#[command(about = "Multiplexed reverse-tunnel client", long_about = None)]
#[command(version)]
struct Cli {
    /// Tunnel server URL (ws:// or wss://)
    #[arg(short, long, env = "WSTUN_SERVER")]
    server: Option<String>,

    /// Authentication token
    #[arg(short, long, env = "WSTUN_AUTH")]
    auth: Option<String>,

    /// Local forward: listen locally, tunnel to a peer-side target
    /// (listen:host:port, repeatable)
    #[arg(short = 'L', long = "local", value_name = "SPEC")]
    local: Vec<String>,

    /// Remote forward: the peer listens, connections tunnel back to a
    /// local target (listen:host:port, repeatable)
    #[arg(short = 'R', long = "remote", value_name = "SPEC")]
    remote: Vec<String>,

    /// Dynamic forward: local SOCKS5 listener, target chosen per
    /// connection (listen address, repeatable)
    #[arg(short = 'D', long = "dynamic", value_name = "ADDR")]
    dynamic: Vec<String>,

    /// JSON config file; command-line forwards are added to its lists
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = build_config(&cli)?;
    let client = TunnelClient::new(config, Arc::new(WebSocketConnector::new()))
        .context("invalid configuration")?;

    let shutdown = client.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            shutdown.shutdown();
        }
    });

    client.run().await.context("tunnel client failed")?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => ClientConfig::default(),
    };

    if let Some(server) = &cli.server {
        config.server = server.clone();
    }
    if let Some(auth) = &cli.auth {
        config.auth = auth.clone();
    }
    config.local.extend(cli.local.iter().cloned());
    config.remote.extend(cli.remote.iter().cloned());
    config.dynamic.extend(cli.dynamic.iter().cloned());

    Ok(config)
}
