//! Relay server implementation
//!
//! Binds the listener, serves the relay router and coordinates shutdown of
//! every open connection.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use super::handler::{router, RelayState};
use crate::config::RelayConfig;
use crate::relay::ConnectionRegistry;

/// Errors that can occur while running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] io::Error),
}

/// Relay server for simulator and dashboard clients
pub struct RelayServer {
    config: RelayConfig,
    registry: ConnectionRegistry,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: ConnectionRegistry::new(),
            shutdown_tx,
        }
    }

    /// Registry of currently open connections
    #[cfg(test)]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.socket_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Serve connections on `listener` until shutdown is triggered
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!("Serving static files from {}", self.config.static_root.display());
        info!(
            "Dashboard {} -> {}",
            self.config.dashboard_route,
            self.config.dashboard_path.display()
        );
        info!(
            "Relay server listening on ws://{}{}",
            local_addr, self.config.ws_route
        );

        let state = RelayState::new(
            self.registry.clone(),
            self.config.outbound_buffer,
            self.shutdown_tx.clone(),
        );
        let app = router(&self.config, state).into_make_service_with_connect_info::<SocketAddr>();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received, stopping server");
            })
            .await?;

        let remaining = self.registry.clear().await;
        if remaining > 0 {
            info!("Dropped {} connections still registered at shutdown", remaining);
        }

        Ok(())
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}
