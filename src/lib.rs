//! # Avatar Relay Server
//!
//! Authenticated WebSocket relay for avatar traffic: binary ping
//! messages fanned out from each sender to its subscribers, with
//! per-identity rate and size quotas enforced in one-second windows.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    AVATAR RELAY SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  quota.rs        - Per-identity rate/size windows            │
//! │  store.rs        - Credential and subscription stores        │
//! │                                                              │
//! │  network/        - WebSocket layer                           │
//! │  ├── protocol.rs - Tagged binary frame codec                 │
//! │  ├── registry.rs - Identity -> connection map                │
//! │  ├── fanout.rs   - Ping and event routing                    │
//! │  ├── session.rs  - Per-connection state machine              │
//! │  └── server.rs   - Accept loop, pump tasks, keepalive        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection Contract
//!
//! The first frame on a connection must be a TOKEN; anything else
//! closes with code 3000. One live connection per identity: a second
//! handshake for the same identity displaces the first with code 4000.
//! All subsequent frames are tagged binary; malformed or unknown frames
//! are dropped without terminating the connection.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod quota;
pub mod store;

// Re-export commonly used types
pub use network::{
    CloseReason, FanoutDispatcher, RelayServer, RelayServerError, ServerConfig, ServerPacket,
};
pub use quota::{QuotaConfig, QuotaLimiter, Verdict};
pub use store::{
    CredentialStore, MemoryCredentialStore, MemorySubscriptionStore, SubscriptionStore,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
