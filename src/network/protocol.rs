//! Binary Wire Protocol
//!
//! Fixed-layout binary messages in both directions, one message per
//! WebSocket frame. No message carries a length prefix for its trailing
//! payload; the transport's own framing delimits boundaries, so this codec
//! requires a message-oriented transport rather than a raw byte stream.

use uuid::Uuid;

/// Client-to-server message tags.
mod c2s {
    pub const TOKEN: u8 = 0;
    pub const PING: u8 = 1;
    pub const SUB: u8 = 2;
    pub const UNSUB: u8 = 3;
}

/// Server-to-client message tags.
mod s2c {
    pub const AUTH: u8 = 0;
    pub const PING: u8 = 1;
    pub const EVENT: u8 = 2;
    pub const TOAST: u8 = 3;
    pub const CHAT: u8 = 4;
    pub const NOTICE: u8 = 5;
    pub const KEEPALIVE: u8 = 6;
}

// =============================================================================
// CLIENT -> SERVER FRAMES
// =============================================================================

/// A decoded client frame.
///
/// Decoding never fails: malformed and unrecognized frames get their own
/// variants so the session state machine matches exhaustively instead of
/// probing for null payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Authentication token (tag 0). NUL bytes are removed and surrounding
    /// whitespace stripped; an empty result is still reported as `Token`
    /// and rejected by the session.
    Token(String),

    /// A ping to relay to the sender's subscribers (tag 1).
    Ping {
        /// Client-assigned ping id, echoed verbatim to subscribers.
        id: i32,
        /// Request a self-echo of this ping back to the sender.
        sync: bool,
        /// Opaque payload, relayed untouched.
        data: Vec<u8>,
    },

    /// Subscribe to a target identity (tag 2, exactly 17 bytes).
    Sub(Uuid),

    /// Unsubscribe from a target identity (tag 3, exactly 17 bytes).
    Unsub(Uuid),

    /// Recognized tag with a payload of the wrong shape. Dropped by the
    /// caller with no feedback to the sender.
    Malformed {
        /// The tag byte of the offending frame.
        tag: u8,
    },

    /// Unrecognized tag. Payload ignored.
    Unknown {
        /// The tag byte of the offending frame.
        tag: u8,
    },

    /// Zero-length frame; carries no message.
    Empty,
}

impl ClientFrame {
    /// Decode a single inbound frame.
    pub fn decode(frame: &[u8]) -> ClientFrame {
        let Some(&tag) = frame.first() else {
            return ClientFrame::Empty;
        };
        let rest = &frame[1..];

        match tag {
            c2s::TOKEN => match std::str::from_utf8(rest) {
                Ok(s) => ClientFrame::Token(s.replace('\0', "").trim().to_string()),
                Err(_) => ClientFrame::Malformed { tag },
            },
            c2s::PING => {
                if frame.len() < 6 {
                    return ClientFrame::Malformed { tag };
                }
                let mut id_bytes = [0u8; 4];
                id_bytes.copy_from_slice(&frame[1..5]);
                ClientFrame::Ping {
                    id: i32::from_be_bytes(id_bytes),
                    sync: frame[5] != 0,
                    data: frame[6..].to_vec(),
                }
            }
            c2s::SUB | c2s::UNSUB => {
                if frame.len() != 17 {
                    return ClientFrame::Malformed { tag };
                }
                let mut id_bytes = [0u8; 16];
                id_bytes.copy_from_slice(&frame[1..17]);
                let target = Uuid::from_bytes(id_bytes);
                if tag == c2s::SUB {
                    ClientFrame::Sub(target)
                } else {
                    ClientFrame::Unsub(target)
                }
            }
            _ => ClientFrame::Unknown { tag },
        }
    }
}

// =============================================================================
// SERVER -> CLIENT PACKETS
// =============================================================================

/// Toast sub-types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ToastKind {
    /// Plain informational toast.
    Default = 0,
    /// Warning toast.
    Warning = 1,
    /// Error toast.
    Error = 2,
    /// Easter-egg toast.
    Cheese = 3,
}

/// Notice sub-types sent when a quota is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NoticeKind {
    /// Per-second byte volume exceeded.
    Size = 0,
    /// Per-second message count exceeded.
    Rate = 1,
}

/// An outbound packet, encoded just before sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// Handshake acknowledgment; tag byte only.
    Auth,

    /// A relayed ping from `source`.
    Ping {
        /// Identity that sent the ping.
        source: Uuid,
        /// Client-assigned ping id.
        id: i32,
        /// Sync flag as sent by the source.
        sync: bool,
        /// Opaque payload.
        data: Vec<u8>,
    },

    /// `source`'s published state changed; subscribers should re-fetch it.
    Event {
        /// Identity whose content changed.
        source: Uuid,
    },

    /// A popup toast. The title must not contain a NUL byte: the separator
    /// between title and message is a single NUL, so a NUL inside the title
    /// makes the packet ambiguous to decode. That is a contract on the
    /// producer, not something this codec enforces.
    Toast {
        /// Toast sub-type.
        kind: ToastKind,
        /// Title text (no NUL bytes).
        title: String,
        /// Message text (may be empty).
        message: String,
    },

    /// A chat line.
    Chat(String),

    /// Quota violation notice.
    Notice(NoticeKind),

    /// Liveness probe; tag byte only.
    KeepAlive,
}

impl ServerPacket {
    /// Encode to the wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerPacket::Auth => vec![s2c::AUTH],
            ServerPacket::Ping { source, id, sync, data } => {
                let (hi, lo) = source.as_u64_pair();
                let mut buf = Vec::with_capacity(22 + data.len());
                buf.push(s2c::PING);
                buf.extend_from_slice(&hi.to_be_bytes());
                buf.extend_from_slice(&lo.to_be_bytes());
                buf.extend_from_slice(&id.to_be_bytes());
                buf.push(u8::from(*sync));
                buf.extend_from_slice(data);
                buf
            }
            ServerPacket::Event { source } => {
                let (hi, lo) = source.as_u64_pair();
                let mut buf = Vec::with_capacity(17);
                buf.push(s2c::EVENT);
                buf.extend_from_slice(&hi.to_be_bytes());
                buf.extend_from_slice(&lo.to_be_bytes());
                buf
            }
            ServerPacket::Toast { kind, title, message } => {
                let mut buf = Vec::with_capacity(3 + title.len() + message.len());
                buf.push(s2c::TOAST);
                buf.push(*kind as u8);
                buf.extend_from_slice(title.as_bytes());
                buf.push(0);
                buf.extend_from_slice(message.as_bytes());
                buf
            }
            ServerPacket::Chat(message) => {
                let mut buf = Vec::with_capacity(1 + message.len());
                buf.push(s2c::CHAT);
                buf.extend_from_slice(message.as_bytes());
                buf
            }
            ServerPacket::Notice(kind) => vec![s2c::NOTICE, *kind as u8],
            ServerPacket::KeepAlive => vec![s2c::KEEPALIVE],
        }
    }
}

// =============================================================================
// TEST FRAME BUILDERS
// =============================================================================
