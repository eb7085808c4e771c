//! Network Layer
//!
//! WebSocket server for real-time avatar traffic. Sessions authenticate
//! with an opaque token, then exchange tagged binary frames; routing is
//! driven by the subscription store.

pub mod fanout;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use fanout::FanoutDispatcher;
pub use protocol::{ClientFrame, NoticeKind, ServerPacket, ToastKind};
pub use registry::{CloseReason, ConnectionRegistry, Outbound, OutboundHandle};
pub use server::{RelayServer, RelayServerError, ServerConfig};
pub use session::{Session, SessionContext, SessionEvent, SessionPhase};
