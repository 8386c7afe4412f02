//! Chorus wire protocol.
//!
//! The transport unit is a [`Frame`]: a fixed 64-byte binary header (big
//! endian, zero-copy parsed) followed by a CBOR payload. The header carries
//! everything needed to route a frame (opcode, room, sender, message id,
//! notification recipient) so the server never has to deserialize a payload
//! just to decide where it goes.
//!
//! Payloads are modeled by the [`Payload`] enum with exactly one opcode per
//! variant; see [`payloads`] for the message catalog.

mod errors;
mod frame;
mod header;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use payloads::Payload;

/// ALPN protocol identifier for QUIC connections.
pub const ALPN_PROTOCOL: &[u8] = b"chorus";

/// Frame operation codes.
///
/// Grouped by concern: session management (0x000x), room subscription
/// (0x001x), messaging (0x002x), resync (0x003x), notifications (0x004x),
/// and the error frame (0x00FF).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client handshake carrying the credential
    Hello = 0x0001,
    /// Server handshake acknowledgment
    HelloReply = 0x0002,
    /// Graceful disconnect
    Goodbye = 0x0003,
    /// Keepalive ping
    Ping = 0x0004,
    /// Keepalive pong
    Pong = 0x0005,

    /// Subscribe to the room in the header
    Subscribe = 0x0010,
    /// Subscription granted
    SubscribeAck = 0x0011,
    /// Unsubscribe from the room in the header (idempotent)
    Unsubscribe = 0x0012,
    /// Unsubscription acknowledged
    UnsubscribeAck = 0x0013,

    /// Post a message to the room in the header
    PostMessage = 0x0020,
    /// Synchronous acknowledgment carrying the persisted message
    MessageAck = 0x0021,
    /// Live push of a persisted message to room subscribers
    MessageEvent = 0x0022,

    /// Pull-path request for the room's message log
    SyncRequest = 0x0030,
    /// Pull-path response, ascending by message id
    SyncResponse = 0x0031,

    /// User-channel push of a persisted notification
    Notification = 0x0040,

    /// Error response
    Error = 0x00FF,
}

impl Opcode {
    /// Opcode as raw u16.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a raw u16 opcode. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Hello),
            0x0002 => Some(Self::HelloReply),
            0x0003 => Some(Self::Goodbye),
            0x0004 => Some(Self::Ping),
            0x0005 => Some(Self::Pong),
            0x0010 => Some(Self::Subscribe),
            0x0011 => Some(Self::SubscribeAck),
            0x0012 => Some(Self::Unsubscribe),
            0x0013 => Some(Self::UnsubscribeAck),
            0x0020 => Some(Self::PostMessage),
            0x0021 => Some(Self::MessageAck),
            0x0022 => Some(Self::MessageEvent),
            0x0030 => Some(Self::SyncRequest),
            0x0031 => Some(Self::SyncResponse),
            0x0040 => Some(Self::Notification),
            0x00FF => Some(Self::Error),
            _ => None,
        }
    }
}
