//! Per-connection relay loop
//!
//! Each accepted WebSocket runs its own loop: inbound text frames are
//! broadcast to every other registered connection, and a separate writer
//! task drains the connection's outbound queue into its socket.

use std::fmt;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::{ConnectionId, ConnectionRegistry, PeerHandle};

/// Lifecycle state of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered and reading frames
    Open,
    /// Termination observed, cleanup pending
    Closing,
    /// Deregistered and transport released
    Closed,
}

/// Why a relay loop stopped reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame
    PeerClosed,
    /// Stream ended without a close frame
    EndOfStream,
    /// Transport reported an error
    TransportError(String),
    /// Server is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// What the relay loop does with one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text payload to broadcast verbatim
    Relay(String),
    /// Frame with no relay effect
    Ignore,
    /// Stop reading
    Terminate(CloseReason),
}

/// Map the next item of a WebSocket stream to a relay action
pub fn classify<E: fmt::Display>(frame: Option<Result<Message, E>>) -> Inbound {
    match frame {
        Some(Ok(Message::Text(text))) => Inbound::Relay(text.as_str().to_owned()),
        Some(Ok(Message::Binary(data))) => {
            debug!("Ignoring binary frame ({} bytes)", data.len());
            Inbound::Ignore
        }
        // Pings are answered by the transport
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Inbound::Ignore,
        Some(Ok(Message::Close(_))) => Inbound::Terminate(CloseReason::PeerClosed),
        Some(Err(e)) => Inbound::Terminate(CloseReason::TransportError(e.to_string())),
        None => Inbound::Terminate(CloseReason::EndOfStream),
    }
}

/// Relay state for a single connection
pub struct RelayConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    registry: ConnectionRegistry,
    state: ConnectionState,
}

impl RelayConnection {
    /// Create a relay connection for an already registered peer
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, registry: ConnectionRegistry) -> Self {
        Self {
            id,
            peer_addr,
            registry,
            state: ConnectionState::Open,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Read frames until the connection terminates or shutdown is signalled
    ///
    /// Leaves the connection in `Closing`; call [`RelayConnection::close`] to
    /// deregister it.
    pub async fn run<S, E>(
        &mut self,
        inbound: &mut S,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> CloseReason
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let frame = tokio::select! {
                frame = inbound.next() => frame,
                _ = shutdown_rx.recv() => return self.begin_shutdown(),
            };

            match classify(frame) {
                Inbound::Relay(text) => {
                    debug!("Relaying {} bytes from {}", text.len(), self.peer_addr);
                    // A peer with a full queue must not hold off shutdown
                    let report = tokio::select! {
                        report = self.registry.broadcast(self.id, &text) => Some(report),
                        _ = shutdown_rx.recv() => None,
                    };
                    let Some(report) = report else {
                        return self.begin_shutdown();
                    };
                    if report.failed > 0 {
                        warn!(
                            "Relay from {} reached {} peers, {} failed",
                            self.peer_addr, report.delivered, report.failed
                        );
                    }
                }
                Inbound::Ignore => {}
                Inbound::Terminate(reason) => {
                    self.state = ConnectionState::Closing;
                    return reason;
                }
            }
        }
    }

    fn begin_shutdown(&mut self) -> CloseReason {
        info!("Shutdown signal received, closing connection to {}", self.peer_addr);
        self.state = ConnectionState::Closing;
        CloseReason::Shutdown
    }

    /// Deregister the connection
    ///
    /// Safe to call more than once; returns `true` only for the call that
    /// actually removed the registry entry.
    pub async fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closing;
        let removed = self.registry.remove(self.id).await;
        self.state = ConnectionState::Closed;
        removed
    }
}

/// Drain an outbound queue into a WebSocket sink
///
/// Stops at the first write failure, dropping the queue so that later
/// broadcasts see the peer as closed. When every queue handle is gone a
/// close frame is sent.
pub async fn forward_outbound<S>(mut outbound_rx: mpsc::Receiver<String>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    while let Some(text) = outbound_rx.recv().await {
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!("Outbound write failed: {}", e);
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

/// Run the full lifecycle of an upgraded WebSocket
pub async fn relay_socket(
    socket: WebSocket,
    peer_addr: SocketAddr,
    registry: ConnectionRegistry,
    outbound_buffer: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let id = ConnectionId::new();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (peer, outbound_rx) = PeerHandle::channel(id, outbound_buffer);

    registry.add(peer).await;
    info!(
        "New connection {} from {} ({} connected)",
        id,
        peer_addr,
        registry.len().await
    );

    let writer = tokio::spawn(forward_outbound(outbound_rx, ws_sender));

    let mut connection = RelayConnection::new(id, peer_addr, registry.clone());
    let reason = connection.run(&mut ws_receiver, &mut shutdown_rx).await;
    match &reason {
        CloseReason::TransportError(_) => {
            error!("Connection {} from {} failed: {}", id, peer_addr, reason)
        }
        _ => debug!("Connection {} from {} stopping: {}", id, peer_addr, reason),
    }

    connection.close().await;
    if let Err(e) = writer.await {
        warn!("Writer task for {} did not finish cleanly: {}", id, e);
    }

    info!(
        "Connection {} from {} closed ({} connected)",
        id,
        peer_addr,
        registry.len().await
    );
}
