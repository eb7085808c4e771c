//! WebSocket Relay Server
//!
//! Async WebSocket server for avatar traffic. Accepts connections,
//! drives the per-connection session state machine, and pumps outbound
//! packets from the registry's channels onto the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::fanout::FanoutDispatcher;
use crate::network::protocol::{ServerPacket, ToastKind};
use crate::network::registry::{
    CloseReason, ConnectionRegistry, Outbound, OutboundHandle, OUTBOUND_CAPACITY,
};
use crate::network::session::{Session, SessionContext, SessionEvent};
use crate::quota::{QuotaConfig, QuotaLimiter};
use crate::store::{CredentialStore, SubscriptionStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Seconds between KEEPALIVE broadcasts. 0 disables them.
    pub keepalive_secs: u64,
    /// Quota applied to identities without a specific entry.
    pub default_quota: QuotaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 1000,
            keepalive_secs: 30,
            default_quota: QuotaConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build a config from `RELAY_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = std::env::var("RELAY_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind_addr);
        let max_connections = std::env::var("RELAY_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_connections);
        let keepalive_secs = std::env::var("RELAY_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.keepalive_secs);

        Self {
            bind_addr,
            max_connections,
            keepalive_secs,
            default_quota: defaults.default_quota,
        }
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The relay server.
pub struct RelayServer {
    /// Server configuration.
    config: ServerConfig,
    /// Shared state handed to every session.
    ctx: SessionContext,
    /// Live connection count, including connections mid-handshake.
    active: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server over the given stores.
    pub fn new(
        config: ServerConfig,
        credentials: Arc<dyn CredentialStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(FanoutDispatcher::new(
            registry.clone(),
            subscriptions.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            ctx: SessionContext {
                registry,
                credentials,
                subscriptions,
                limiter: Arc::new(QuotaLimiter::new()),
                fanout,
            },
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Run the server until shutdown is signaled.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RelayServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Relay server listening on {}", self.config.bind_addr);

        let keepalive_handle = self.spawn_keepalive_loop();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.active.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if let Some(handle) = keepalive_handle {
            handle.abort();
        }

        // Tell everyone we are going away, then close cleanly.
        let farewell = ServerPacket::Toast {
            kind: ToastKind::Warning,
            title: "Server".to_string(),
            message: "Shutting down".to_string(),
        };
        self.ctx.registry.broadcast_all(&farewell.encode());
        self.ctx.registry.close_all(CloseReason::Normal);

        Ok(())
    }

    /// Spawn the periodic KEEPALIVE broadcast, if enabled.
    fn spawn_keepalive_loop(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.config.keepalive_secs == 0 {
            return None;
        }

        let registry = self.ctx.registry.clone();
        let period = Duration::from_secs(self.config.keepalive_secs);
        let frame = ServerPacket::KeepAlive.encode();

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reached = registry.broadcast_all(&frame);
                debug!(reached, "keepalive broadcast");
            }
        }))
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let active = self.active.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        active.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", addr, e);
                    active.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
            let handle = OutboundHandle::new(out_tx);
            let mut session = Session::new(ctx, handle.clone());

            // Pump task: drains the outbound queue onto the socket. A Close
            // variant terminates the pump after the close frame is written.
            let pump = tokio::spawn(async move {
                while let Some(out) = out_rx.recv().await {
                    match out {
                        Outbound::Packet(bytes) => {
                            if ws_sender.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Outbound::Close(reason) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(reason.code()),
                                reason: reason.label().into(),
                            };
                            let _ = ws_sender.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                match session.on_message(&data) {
                                    SessionEvent::Continue => {}
                                    SessionEvent::Close(reason) => {
                                        handle.close(reason);
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Text(_))) => {
                                debug!("Text frame from {} ignored", addr);
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            // Ping/Pong are answered by the protocol layer.
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        handle.close(CloseReason::Normal);
                        break;
                    }
                }
            }

            session.close();
            drop(handle);
            drop(session);

            let _ = pump.await;
            active.fetch_sub(1, Ordering::Relaxed);
            debug!("Connection {} cleaned up", addr);
        });
    }

    /// Signal the server to stop accepting and close all connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// The fanout dispatcher, for pushing events from outside the
    /// WebSocket path (avatar uploads and deletions).
    pub fn fanout(&self) -> &Arc<FanoutDispatcher> {
        &self.ctx.fanout
    }

    /// Number of authenticated connections in the registry.
    pub fn connection_count(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Live connection count, including connections mid-handshake.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}
