//! Connection Registry
//!
//! Concurrent map from identity to the live connection's outbound handle.
//! Register, deregister, and lookup are linearizable under one lock so a
//! delivery never races a handle being evicted and replaced.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::network::protocol::ServerPacket;

/// Bound of each connection's outbound queue. A receiver that stops
/// draining loses packets rather than stalling fanout.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Why a connection is being closed. Mapped to WebSocket close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown, client request, or peer disconnect.
    Normal,
    /// First frame was not a resolvable token.
    AuthFailure,
    /// A newer connection authenticated as the same identity.
    Superseded,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::AuthFailure => 3000,
            CloseReason::Superseded => 4000,
        }
    }

    /// Human-readable close reason sent to the peer.
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::Normal => "Normal Closure",
            CloseReason::AuthFailure => "Authentication failure",
            CloseReason::Superseded => "Session superseded",
        }
    }
}

/// Command queued to a connection's outbound pump task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded packet to forward as one binary message.
    Packet(Vec<u8>),
    /// Send a close frame and stop the pump.
    Close(CloseReason),
}

/// Cloneable sending side of one connection's outbound queue.
///
/// All sends are non-blocking `try_send`: a full or closed queue is
/// reported as an undelivered send, never as an error that propagates to
/// the caller. This is the explicit failure-swallowing boundary of the
/// relay; one unreachable peer must not abort delivery to the rest.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    tx: mpsc::Sender<Outbound>,
}

impl OutboundHandle {
    /// Wrap the sending side of a connection's outbound channel.
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Encode and queue a packet. Returns whether it was accepted.
    pub fn send(&self, packet: &ServerPacket) -> bool {
        self.send_raw(packet.encode())
    }

    /// Queue an already-encoded packet. Returns whether it was accepted.
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.tx.try_send(Outbound::Packet(bytes)).is_ok()
    }

    /// Ask the pump to close the connection. Best-effort.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.tx.try_send(Outbound::Close(reason));
    }
}

/// A registered connection: the handle plus the serial that names this
/// particular registration.
#[derive(Debug, Clone)]
struct Registered {
    serial: u64,
    handle: OutboundHandle,
}

/// Identity -> live connection map shared by all sessions and the fanout
/// dispatcher. At most one entry per identity.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_serial: AtomicU64,
    connections: RwLock<BTreeMap<Uuid, Registered>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the live connection for `identity`, returning
    /// the serial that must be presented to [`deregister`].
    ///
    /// A prior entry for the same identity is evicted and its connection
    /// asked to close: a dangling session that silently stops receiving
    /// traffic is worse than an explicit disconnect.
    ///
    /// [`deregister`]: ConnectionRegistry::deregister
    pub fn register(&self, identity: Uuid, handle: OutboundHandle) -> u64 {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let evicted = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.insert(identity, Registered { serial, handle })
        };
        if let Some(old) = evicted {
            debug!(%identity, "evicting superseded connection");
            old.handle.close(CloseReason::Superseded);
        }
        serial
    }

    /// Remove the entry for `identity` only if it still belongs to the
    /// registration named by `serial`. Returns whether an entry was
    /// removed; a stale deregister after eviction is a no-op.
    pub fn deregister(&self, identity: Uuid, serial: u64) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        match connections.get(&identity) {
            Some(registered) if registered.serial == serial => {
                connections.remove(&identity);
                true
            }
            _ => false,
        }
    }

    /// Best-effort delivery of an encoded packet to `identity`'s live
    /// connection. No entry, a full queue, or a closed peer all drop the
    /// packet; the bool return keeps the boundary observable.
    pub fn send_or_drop(&self, identity: Uuid, packet: Vec<u8>) -> bool {
        let handle = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            connections.get(&identity).map(|r| r.handle.clone())
        };
        match handle {
            Some(handle) => handle.send_raw(packet),
            None => false,
        }
    }

    /// Queue an encoded packet to every registered connection. Returns how
    /// many queues accepted it.
    pub fn broadcast_all(&self, packet: &[u8]) -> usize {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .values()
            .filter(|r| r.handle.send_raw(packet.to_vec()))
            .count()
    }

    /// Ask every registered connection to close.
    pub fn close_all(&self, reason: CloseReason) {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        for registered in connections.values() {
            registered.handle.close(reason);
        }
    }

    /// Whether `identity` has a live connection.
    pub fn contains(&self, identity: Uuid) -> bool {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.contains_key(&identity)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (OutboundHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (OutboundHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn test_register_lookup_deregister() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (h, mut rx) = handle(4);

        let serial = registry.register(id, h);
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.send_or_drop(id, vec![6]));
        assert_eq!(rx.recv().await, Some(Outbound::Packet(vec![6])));

        assert!(registry.deregister(id, serial));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_send_or_drop_missing_identity() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_or_drop(Uuid::new_v4(), vec![1]));
    }

    #[tokio::test]
    async fn test_send_or_drop_closed_receiver() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (h, rx) = handle(4);
        drop(rx);

        registry.register(id, h);
        assert!(!registry.send_or_drop(id, vec![1]));
    }

    #[tokio::test]
    async fn test_send_or_drop_full_queue() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (h, _rx) = handle(1);

        registry.register(id, h);
        assert!(registry.send_or_drop(id, vec![1]));
        // Queue bound reached; packet dropped instead of blocking.
        assert!(!registry.send_or_drop(id, vec![2]));
    }

    #[tokio::test]
    async fn test_reregister_evicts_and_closes_old() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (old, mut old_rx) = handle(4);
        let (new, mut new_rx) = handle(4);

        let old_serial = registry.register(id, old);
        registry.register(id, new);

        // The displaced handle is told to close.
        assert_eq!(
            old_rx.recv().await,
            Some(Outbound::Close(CloseReason::Superseded))
        );

        // Traffic now reaches only the new connection.
        assert!(registry.send_or_drop(id, vec![9]));
        assert_eq!(new_rx.recv().await, Some(Outbound::Packet(vec![9])));

        // The old session's cleanup must not evict the new entry.
        assert!(!registry.deregister(id, old_serial));
        assert!(registry.contains(id));
    }

    #[tokio::test]
    async fn test_broadcast_all_counts_deliveries() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = handle(4);
        let (b, b_rx) = handle(4);
        drop(b_rx);

        registry.register(Uuid::new_v4(), a);
        registry.register(Uuid::new_v4(), b);

        assert_eq!(registry.broadcast_all(&[6]), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_rx) = handle(4);
        let (b, mut b_rx) = handle(4);

        registry.register(Uuid::new_v4(), a);
        registry.register(Uuid::new_v4(), b);
        registry.close_all(CloseReason::Normal);

        assert_eq!(a_rx.recv().await, Some(Outbound::Close(CloseReason::Normal)));
        assert_eq!(b_rx.recv().await, Some(Outbound::Close(CloseReason::Normal)));
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::AuthFailure.code(), 3000);
        assert_eq!(CloseReason::Superseded.code(), 4000);
    }
}
