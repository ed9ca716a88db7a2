//! HTTP routes
//!
//! Mounts the WebSocket relay endpoint, the dashboard alias and the static
//! file fallback on a single router.

use std::net::SocketAddr;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::Response,
    routing::get,
    Router,
};
use tokio::sync::broadcast;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::config::RelayConfig;
use crate::relay::{relay_socket, ConnectionRegistry};

/// Shared state handed to every WebSocket upgrade
#[derive(Clone)]
pub struct RelayState {
    registry: ConnectionRegistry,
    outbound_buffer: usize,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayState {
    pub fn new(
        registry: ConnectionRegistry,
        outbound_buffer: usize,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            outbound_buffer,
            shutdown_tx,
        }
    }
}

/// Build the application router
///
/// The dashboard route is served from `dashboard_path` and shadows any
/// same-named file under `static_root`. Every other path falls through to
/// the static root.
pub fn router(config: &RelayConfig, state: RelayState) -> Router {
    let static_files =
        ServeDir::new(&config.static_root).append_index_html_on_directories(false);

    Router::new()
        .route(&config.ws_route, get(ws_upgrade))
        .route_service(
            &config.dashboard_route,
            ServeFile::new(&config.dashboard_path),
        )
        .fallback_service(static_files)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    debug!("WebSocket upgrade request from {}", peer_addr);
    let shutdown_rx = state.shutdown_tx.subscribe();

    ws.on_upgrade(move |socket| {
        relay_socket(
            socket,
            peer_addr,
            state.registry,
            state.outbound_buffer,
            shutdown_rx,
        )
    })
}
