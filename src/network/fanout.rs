//! Fanout Dispatcher
//!
//! Resolves a target identity's subscribers and pushes one packet to each
//! live connection through the registry. Delivery is at-most-once and
//! best-effort; an unreachable subscriber never affects the rest.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::network::protocol::ServerPacket;
use crate::network::registry::ConnectionRegistry;
use crate::store::SubscriptionStore;

/// Pushes pings and change events to a target's subscribers.
pub struct FanoutDispatcher {
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl FanoutDispatcher {
    /// Create a dispatcher over the shared registry and subscription store.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            registry,
            subscriptions,
        }
    }

    /// Relay a ping from `source` to its subscribers.
    ///
    /// The source is always skipped while iterating subscribers; when
    /// `sync` is set it receives exactly one self-echo afterwards, whether
    /// or not it subscribes to itself. Returns the number of queues that
    /// accepted the packet.
    pub fn broadcast_ping(&self, source: Uuid, ping_id: i32, sync: bool, data: &[u8]) -> usize {
        let packet = ServerPacket::Ping {
            source,
            id: ping_id,
            sync,
            data: data.to_vec(),
        }
        .encode();

        let mut delivered = 0;
        for subscriber in self.subscriptions.subscribers_of(source) {
            if subscriber == source {
                continue;
            }
            if self.registry.send_or_drop(subscriber, packet.clone()) {
                delivered += 1;
            }
        }
        if sync && self.registry.send_or_drop(source, packet) {
            delivered += 1;
        }

        debug!(%source, ping_id, sync, delivered, "ping fanout");
        delivered
    }

    /// Notify `source`'s subscribers that its published state changed.
    /// The source itself is never notified. Invoked by the external upload
    /// path after a successful content commit.
    pub fn broadcast_event(&self, source: Uuid) -> usize {
        let packet = ServerPacket::Event { source }.encode();

        let mut delivered = 0;
        for subscriber in self.subscriptions.subscribers_of(source) {
            if subscriber == source {
                continue;
            }
            if self.registry.send_or_drop(subscriber, packet.clone()) {
                delivered += 1;
            }
        }

        debug!(%source, delivered, "event fanout");
        delivered
    }
}
