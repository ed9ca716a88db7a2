//! Connection registry
//!
//! Maintains the set of open connections and performs best-effort broadcast
//! writes to them. Safe to share between connection tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identity of a connection for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Write handle to a peer's outbound queue
///
/// The registry holds this handle, not the socket itself. The socket stays
/// with the connection task; a writer task drains the queue into it.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
}

impl PeerHandle {
    /// Create a peer handle and the receiving end of its outbound queue
    pub fn channel(id: ConnectionId, buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(buffer);
        (Self { id, outbound }, rx)
    }

    /// Get the connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    async fn send(&self, payload: String) -> Result<(), mpsc::error::SendError<String>> {
        self.outbound.send(payload).await
    }
}

/// Outcome of a single broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the payload was queued for
    pub delivered: usize,
    /// Peers skipped because their transport was already closed
    pub skipped: usize,
    /// Peers whose write failed mid-broadcast
    pub failed: usize,
}

/// Registry of all open connections
///
/// Broadcast snapshots the members under a read lock and writes after the
/// lock is released, so concurrent `add`/`remove` never wait on peer I/O.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    peers: Arc<RwLock<HashMap<ConnectionId, PeerHandle>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection
    pub async fn add(&self, peer: PeerHandle) {
        let id = peer.id();
        self.peers.write().await.insert(id, peer);
        debug!("Registered connection {}", id);
    }

    /// Deregister a connection
    ///
    /// Returns `false` if the connection was not registered.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.peers.write().await.remove(&id).is_some();
        if removed {
            debug!("Deregistered connection {}", id);
        }
        removed
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    /// Drop every registered handle, closing all outbound queues
    ///
    /// Returns the number of connections that were registered.
    pub async fn clear(&self) -> usize {
        let mut peers = self.peers.write().await;
        let count = peers.len();
        peers.clear();
        count
    }

    /// Send `payload` to every registered connection except `sender`
    ///
    /// Failures are per peer: a closed or failing peer is logged and counted
    /// in the report, and delivery to the remaining peers continues.
    pub async fn broadcast(&self, sender: ConnectionId, payload: &str) -> BroadcastReport {
        let targets: Vec<PeerHandle> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|peer| peer.id() != sender)
                .cloned()
                .collect()
        };

        let mut report = BroadcastReport::default();
        for peer in targets {
            if peer.is_closed() {
                debug!("Skipping closed connection {}", peer.id());
                report.skipped += 1;
                continue;
            }

            match peer.send(payload.to_owned()).await {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    warn!("Failed to relay message to {}", peer.id());
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (peer, rx) = PeerHandle::channel(id, 16);
        registry.add(peer).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_registry_new() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty().await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = connect(&registry).await;
        let (_b, mut rx_b) = connect(&registry).await;
        let (_c, mut rx_c) = connect(&registry).await;

        let report = registry.broadcast(a, "hello").await;
        assert_eq!(report.delivered, 2);

        assert_eq!(rx_b.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx_c.recv().await.as_deref(), Some("hello"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removed_peer_not_targeted() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry).await;
        let (b, mut rx_b) = connect(&registry).await;
        let (_c, mut rx_c) = connect(&registry).await;

        assert!(registry.remove(b).await);
        let report = registry.broadcast(a, "world").await;

        assert_eq!(report.delivered, 1);
        assert_eq!(rx_c.recv().await.as_deref(), Some("world"));
        // Handle dropped with the registry entry, so the queue is closed and empty
        assert_eq!(rx_b.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_peer_does_not_block_others() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry).await;
        let (_b, rx_b) = connect(&registry).await;
        let (_c, mut rx_c) = connect(&registry).await;

        drop(rx_b);
        let report = registry.broadcast(a, "hello").await;

        assert_eq!(
            report,
            BroadcastReport {
                delivered: 1,
                skipped: 1,
                failed: 0,
            }
        );
        assert_eq!(rx_c.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_peer_dropped_mid_send_counts_as_failed() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry).await;
        let (b, rx_b) = PeerHandle::channel(ConnectionId::new(), 1);
        registry.add(b).await;

        // Fill the peer queue so the next send has to wait
        assert_eq!(registry.broadcast(a, "first").await.delivered, 1);

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.broadcast(a, "second").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(rx_b);

        let report = pending.await.unwrap();
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 0,
                skipped: 0,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry).await;
        let (_b, _rx_b) = connect(&registry).await;

        assert!(registry.remove(a).await);
        assert!(!registry.remove(a).await);
        assert_eq!(registry.len().await, 1);
        assert!(!registry.contains(a).await);
    }

    #[tokio::test]
    async fn test_broadcast_preserves_sender_order() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry).await;
        let (_b, mut rx_b) = connect(&registry).await;

        for i in 0..10 {
            registry.broadcast(a, &format!("msg-{}", i)).await;
        }
        for i in 0..10 {
            assert_eq!(rx_b.recv().await, Some(format!("msg-{}", i)));
        }
    }

    #[tokio::test]
    async fn test_concurrent_add_remove_broadcast() {
        let registry = ConnectionRegistry::new();
        let (sender, _rx) = connect(&registry).await;

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = ConnectionId::new();
                let (peer, mut rx) = PeerHandle::channel(id, 4);
                registry.add(peer).await;
                let _ = rx.try_recv();
                registry.remove(id).await;
            }));
        }
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.broadcast(sender, "tick").await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(sender).await);
    }

    #[tokio::test]
    async fn test_clear_closes_queues() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = connect(&registry).await;
        let (_b, mut rx_b) = connect(&registry).await;

        assert_eq!(registry.clear().await, 2);
        assert!(registry.is_empty().await);
        assert_eq!(rx_a.recv().await, None);
        assert_eq!(rx_b.recv().await, None);
    }
}
