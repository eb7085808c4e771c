//! Session Lifecycle
//!
//! One `Session` per live connection, owned exclusively by that
//! connection's task. The state machine is transport-free: the server
//! feeds it raw inbound frames and executes the close reason it returns,
//! which keeps every transition unit-testable with in-memory stores.
//!
//! There is deliberately no blanket error suppression around frame
//! handling: each fallible path is an explicit match arm, so malformed
//! input degrades per the protocol while programming errors still fail
//! loudly.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::fanout::FanoutDispatcher;
use crate::network::protocol::{ClientFrame, NoticeKind, ServerPacket};
use crate::network::registry::{CloseReason, ConnectionRegistry, OutboundHandle};
use crate::quota::{QuotaConfig, QuotaLimiter, Verdict};
use crate::store::{CredentialStore, SubscriptionStore};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Connection accepted; the first frame must be a TOKEN.
    AwaitingToken,
    /// Handshake complete; frames are routed.
    Authenticated,
    /// Terminal. Cleanup has run.
    Closed,
}

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Keep the connection open.
    Continue,
    /// Close the connection with the given reason.
    Close(CloseReason),
}

/// Shared relay state handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    /// Identity -> live connection map.
    pub registry: Arc<ConnectionRegistry>,
    /// Token resolution and quota limits.
    pub credentials: Arc<dyn CredentialStore>,
    /// Subscription edges.
    pub subscriptions: Arc<dyn SubscriptionStore>,
    /// Per-identity rate/volume windows.
    pub limiter: Arc<QuotaLimiter>,
    /// Ping and event routing.
    pub fanout: Arc<FanoutDispatcher>,
}

/// Server-side state for one connection, handshake to close.
pub struct Session {
    ctx: SessionContext,
    handle: OutboundHandle,
    phase: SessionPhase,
    identity: Option<Uuid>,
    registration: Option<u64>,
    limits: QuotaConfig,
}

impl Session {
    /// Create a session for a freshly accepted connection.
    pub fn new(ctx: SessionContext, handle: OutboundHandle) -> Self {
        Self {
            ctx,
            handle,
            phase: SessionPhase::AwaitingToken,
            identity: None,
            registration: None,
            limits: QuotaConfig::default(),
        }
    }

    /// Handle one inbound frame.
    pub fn on_message(&mut self, frame: &[u8]) -> SessionEvent {
        match self.phase {
            SessionPhase::AwaitingToken => self.handshake(frame),
            SessionPhase::Authenticated => {
                self.dispatch(frame);
                SessionEvent::Continue
            }
            SessionPhase::Closed => SessionEvent::Close(CloseReason::Normal),
        }
    }

    /// First-frame handshake. Anything other than a resolvable, non-empty
    /// token closes the connection without registering.
    fn handshake(&mut self, frame: &[u8]) -> SessionEvent {
        let token = match ClientFrame::decode(frame) {
            ClientFrame::Token(token) if !token.is_empty() => token,
            other => {
                warn!(frame = frame_kind(&other), "handshake frame was not a token");
                return SessionEvent::Close(CloseReason::AuthFailure);
            }
        };

        let Some(identity) = self.ctx.credentials.resolve_token(&token) else {
            warn!("unresolvable token presented");
            return SessionEvent::Close(CloseReason::AuthFailure);
        };

        // Quota limits are snapshotted once per connection.
        self.limits = self.ctx.credentials.quota_config(identity);
        let serial = self.ctx.registry.register(identity, self.handle.clone());
        self.identity = Some(identity);
        self.registration = Some(serial);
        self.phase = SessionPhase::Authenticated;
        self.handle.send(&ServerPacket::Auth);

        info!(%identity, "session authenticated");
        SessionEvent::Continue
    }

    /// Authenticated frame dispatch. Malformed and unknown frames are
    /// dropped without feedback; the connection stays open.
    fn dispatch(&mut self, frame: &[u8]) {
        let Some(identity) = self.identity else {
            // Authenticated phase always has an identity.
            debug_assert!(false, "authenticated session without identity");
            return;
        };

        match ClientFrame::decode(frame) {
            ClientFrame::Ping { id, sync, data } => {
                match self.ctx.limiter.charge(identity, data.len(), &self.limits) {
                    Verdict::Allowed => {
                        self.ctx.fanout.broadcast_ping(identity, id, sync, &data);
                    }
                    Verdict::RateExceeded => {
                        debug!(%identity, "ping rate limit hit");
                        self.handle.send(&ServerPacket::Notice(NoticeKind::Rate));
                    }
                    Verdict::SizeExceeded => {
                        debug!(%identity, bytes = data.len(), "ping size limit hit");
                        self.handle.send(&ServerPacket::Notice(NoticeKind::Size));
                    }
                }
            }
            ClientFrame::Sub(target) => {
                self.ctx.subscriptions.add_edge(identity, target);
            }
            ClientFrame::Unsub(target) => {
                self.ctx.subscriptions.remove_edge(identity, target);
            }
            ClientFrame::Token(_) => {
                debug!(%identity, "token frame after handshake ignored");
            }
            ClientFrame::Malformed { tag } => {
                debug!(%identity, tag, "malformed frame dropped");
            }
            ClientFrame::Unknown { tag } => {
                debug!(%identity, tag, "unknown frame tag ignored");
            }
            ClientFrame::Empty => {}
        }
    }

    /// Tear down the session. Runs on every exit path and is idempotent.
    pub fn close(&mut self) {
        if let (Some(identity), Some(serial)) = (self.identity, self.registration.take()) {
            let owned = self.ctx.registry.deregister(identity, serial);
            // A superseded session no longer owns the registry entry, and
            // must not erase its successor's quota window.
            if owned {
                self.ctx.limiter.forget(identity);
            }
            debug!(%identity, owned, "session closed");
        }
        self.phase = SessionPhase::Closed;
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The authenticated identity, if the handshake completed.
    pub fn identity(&self) -> Option<Uuid> {
        self.identity
    }

    /// This connection's outbound handle.
    pub fn handle(&self) -> &OutboundHandle {
        &self.handle
    }
}

/// Short frame descriptions for handshake logging; payloads are never
/// logged.
fn frame_kind(frame: &ClientFrame) -> &'static str {
    match frame {
        ClientFrame::Token(_) => "token",
        ClientFrame::Ping { .. } => "ping",
        ClientFrame::Sub(_) => "sub",
        ClientFrame::Unsub(_) => "unsub",
        ClientFrame::Malformed { .. } => "malformed",
        ClientFrame::Unknown { .. } => "unknown",
        ClientFrame::Empty => "empty",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::frames;
    use crate::network::registry::Outbound;
    use crate::quota::QuotaConfig;
    use crate::store::{MemoryCredentialStore, MemorySubscriptionStore};
    use tokio::sync::mpsc;

    struct Harness {
        ctx: SessionContext,
        credentials: Arc<MemoryCredentialStore>,
        subscriptions: Arc<MemorySubscriptionStore>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let credentials = Arc::new(MemoryCredentialStore::new(QuotaConfig::default()));
            let subscriptions = Arc::new(MemorySubscriptionStore::new());
            let fanout = Arc::new(FanoutDispatcher::new(
                registry.clone(),
                subscriptions.clone() as Arc<dyn SubscriptionStore>,
            ));
            let ctx = SessionContext {
                registry,
                credentials: credentials.clone() as Arc<dyn CredentialStore>,
                subscriptions: subscriptions.clone() as Arc<dyn SubscriptionStore>,
                limiter: Arc::new(QuotaLimiter::new()),
                fanout,
            };
            Self {
                ctx,
                credentials,
                subscriptions,
            }
        }

        fn session(&self) -> (Session, mpsc::Receiver<Outbound>) {
            let (tx, rx) = mpsc::channel(16);
            (
                Session::new(self.ctx.clone(), OutboundHandle::new(tx)),
                rx,
            )
        }

        /// Open a session and complete its handshake with `token`.
        fn authed(&self, token: &str) -> (Session, mpsc::Receiver<Outbound>) {
            let (mut session, mut rx) = self.session();
            assert_eq!(
                session.on_message(&frames::token(token)),
                SessionEvent::Continue
            );
            // Consume the AUTH acknowledgment.
            assert_eq!(rx.try_recv(), Ok(Outbound::Packet(vec![0])));
            (session, rx)
        }
    }

    fn recv_packet(rx: &mut mpsc::Receiver<Outbound>) -> Option<Vec<u8>> {
        match rx.try_recv() {
            Ok(Outbound::Packet(bytes)) => Some(bytes),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_handshake_success_registers_identity() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        h.credentials.insert_token("tok-123", u1);

        let (session, _rx) = h.authed("tok-123");

        assert_eq!(session.phase(), SessionPhase::Authenticated);
        assert_eq!(session.identity(), Some(u1));
        assert!(h.ctx.registry.contains(u1));
        assert_eq!(h.ctx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_handshake_token_with_nul_padding() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        h.credentials.insert_token("tok-123", u1);

        let (mut session, _rx) = h.session();
        let event = session.on_message(&frames::token("tok-123\0\0"));

        assert_eq!(event, SessionEvent::Continue);
        assert_eq!(session.identity(), Some(u1));
    }

    #[tokio::test]
    async fn test_handshake_unknown_token_closes() {
        let h = Harness::new();
        let (mut session, mut rx) = h.session();

        let event = session.on_message(&frames::token("nope"));

        assert_eq!(event, SessionEvent::Close(CloseReason::AuthFailure));
        assert!(h.ctx.registry.is_empty());
        // No AUTH acknowledgment was sent.
        assert!(recv_packet(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_handshake_empty_token_closes() {
        let h = Harness::new();
        let (mut session, _rx) = h.session();

        let event = session.on_message(&frames::token("\0\0  "));
        assert_eq!(event, SessionEvent::Close(CloseReason::AuthFailure));
    }

    #[tokio::test]
    async fn test_handshake_wrong_frame_type_closes() {
        let h = Harness::new();

        for frame in [frames::ping(1, false, b"x"), frames::sub(Uuid::new_v4()), vec![]] {
            let (mut session, _rx) = h.session();
            assert_eq!(
                session.on_message(&frame),
                SessionEvent::Close(CloseReason::AuthFailure)
            );
        }
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_ping_relayed_to_subscriber_byte_exact() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        h.credentials.insert_token("tok-1", u1);
        h.credentials.insert_token("tok-2", u2);

        let (mut s1, mut rx1) = h.authed("tok-1");
        let (mut s2, mut rx2) = h.authed("tok-2");

        // u2 subscribes to u1, then u1 pings without sync.
        assert_eq!(s2.on_message(&frames::sub(u1)), SessionEvent::Continue);
        assert_eq!(
            s1.on_message(&frames::ping(42, false, b"hi")),
            SessionEvent::Continue
        );

        let (hi, lo) = u1.as_u64_pair();
        let mut expected = vec![1u8];
        expected.extend_from_slice(&hi.to_be_bytes());
        expected.extend_from_slice(&lo.to_be_bytes());
        expected.extend_from_slice(&42i32.to_be_bytes());
        expected.push(0);
        expected.extend_from_slice(b"hi");

        assert_eq!(recv_packet(&mut rx2), Some(expected));
        assert!(recv_packet(&mut rx1).is_none());
    }

    #[tokio::test]
    async fn test_sync_ping_echoed_to_sender() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        h.credentials.insert_token("tok-1", u1);
        h.credentials.insert_token("tok-2", u2);

        let (mut s1, mut rx1) = h.authed("tok-1");
        let (mut s2, mut rx2) = h.authed("tok-2");

        s2.on_message(&frames::sub(u1));
        s1.on_message(&frames::ping(7, true, b"preview"));

        assert!(recv_packet(&mut rx1).is_some());
        assert!(recv_packet(&mut rx2).is_some());
    }

    #[tokio::test]
    async fn test_unsub_stops_future_pings() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        h.credentials.insert_token("tok-1", u1);
        h.credentials.insert_token("tok-2", u2);

        let (mut s1, _rx1) = h.authed("tok-1");
        let (mut s2, mut rx2) = h.authed("tok-2");

        s2.on_message(&frames::sub(u1));
        s1.on_message(&frames::ping(1, false, b"a"));
        assert!(recv_packet(&mut rx2).is_some());

        s2.on_message(&frames::unsub(u1));
        s1.on_message(&frames::ping(2, false, b"b"));
        assert!(recv_packet(&mut rx2).is_none());
    }

    #[tokio::test]
    async fn test_oversized_ping_notices_and_skips_fanout() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        h.credentials.insert_token("tok-1", u1);
        h.credentials.insert_token("tok-2", u2);
        h.credentials.set_quota(
            u1,
            QuotaConfig {
                ping_rate: 32,
                ping_size: 16,
            },
        );

        let (mut s1, mut rx1) = h.authed("tok-1");
        let (mut s2, mut rx2) = h.authed("tok-2");
        s2.on_message(&frames::sub(u1));

        s1.on_message(&frames::ping(1, false, &[0u8; 64]));

        // NOTICE(SIZE) = 0x05 0x00 back to the sender, nothing fanned out.
        assert_eq!(recv_packet(&mut rx1), Some(vec![5, 0]));
        assert!(recv_packet(&mut rx2).is_none());
    }

    #[tokio::test]
    async fn test_rate_exceeded_notices_and_connection_survives() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        h.credentials.insert_token("tok-1", u1);
        h.credentials.set_quota(
            u1,
            QuotaConfig {
                ping_rate: 0,
                ping_size: 1024,
            },
        );

        let (mut s1, mut rx1) = h.authed("tok-1");

        assert_eq!(
            s1.on_message(&frames::ping(1, false, b"x")),
            SessionEvent::Continue
        );
        assert_eq!(recv_packet(&mut rx1), Some(vec![5, 1]));

        // Non-ping traffic still works on the same connection.
        assert_eq!(s1.on_message(&frames::sub(u1)), SessionEvent::Continue);
        assert_eq!(h.subscriptions.subscribers_of(u1), vec![u1]);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_ignored() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        h.credentials.insert_token("tok-1", u1);

        let (mut s1, mut rx1) = h.authed("tok-1");

        // Short ping, short sub, unknown tag, empty frame, late token.
        for frame in [
            vec![1u8, 0, 0],
            vec![2u8, 1, 2, 3],
            vec![200u8, 9, 9],
            vec![],
            frames::token("tok-1"),
        ] {
            assert_eq!(s1.on_message(&frame), SessionEvent::Continue);
        }

        assert_eq!(s1.phase(), SessionPhase::Authenticated);
        assert!(recv_packet(&mut rx1).is_none());
        assert!(h.ctx.registry.contains(u1));
    }

    #[tokio::test]
    async fn test_close_deregisters_and_forgets_quota() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        h.credentials.insert_token("tok-1", u1);

        let (mut s1, _rx1) = h.authed("tok-1");
        s1.on_message(&frames::ping(1, false, b"x"));
        assert_eq!(h.ctx.limiter.tracked(), 1);

        s1.close();

        assert_eq!(s1.phase(), SessionPhase::Closed);
        assert!(h.ctx.registry.is_empty());
        assert_eq!(h.ctx.limiter.tracked(), 0);

        // Idempotent.
        s1.close();
    }

    #[tokio::test]
    async fn test_superseded_session_close_spares_successor() {
        let h = Harness::new();
        let u1 = Uuid::new_v4();
        h.credentials.insert_token("tok-1", u1);

        let (mut old, _old_rx) = h.authed("tok-1");
        let (mut new, _new_rx) = h.authed("tok-1");
        new.on_message(&frames::ping(1, false, b"x"));

        // The displaced session cleans up after the replacement landed.
        old.close();

        assert!(h.ctx.registry.contains(u1));
        assert_eq!(h.ctx.limiter.tracked(), 1);

        new.close();
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_before_auth_is_harmless() {
        let h = Harness::new();
        let (mut session, _rx) = h.session();
        session.close();
        assert_eq!(session.phase(), SessionPhase::Closed);
    }
}
