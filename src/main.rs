//! Relay Bridge Server
//!
//! Relays text messages between simulator and dashboard clients over
//! WebSocket and serves the static pages those clients load.

mod config;
mod relay;
mod server;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{ConfigOverrides, RelayConfig};
use server::RelayServer;

/// Relay Bridge Server
///
/// Broadcasts every text message from one WebSocket client to all others
#[derive(Parser, Debug)]
#[command(name = "relay-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Directory served at the root path
    #[arg(long)]
    static_root: Option<PathBuf>,

    /// File served for the dashboard route
    #[arg(long)]
    dashboard: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind: self.bind.clone(),
            port: self.port,
            static_root: self.static_root.clone(),
            dashboard_path: self.dashboard.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Relay Bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::load_or_default(args.config.as_deref())?
        .with_overrides(args.overrides());
    config.validate()?;

    let server = Arc::new(RelayServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => {
                info!("Received {}, shutting down relay", name);
                server_handle.shutdown();
            }
            Err(e) => error!("Failed to listen for shutdown signals: {}", e),
        }
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM and report which one arrived
async fn shutdown_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<_, io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<io::Result<()>>();

    tokio::select! {
        result = signal::ctrl_c() => result.map(|_| "SIGINT"),
        result = terminate => result.map(|_| "SIGTERM"),
    }
}
