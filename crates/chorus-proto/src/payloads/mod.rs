//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary for performance, but payloads use CBOR for
//! type safety and forward compatibility. The `Payload` enum covers all
//! message types: session management (Hello, Ping, etc.), room messaging
//! (PostMessage, MessageEvent, sync), and user-channel notifications.
//!
//! We chose CBOR over alternatives because it's self-describing (field names
//! embedded), compact, and doesn't need code generation. The server routes
//! frames off the header alone; only the endpoints deserialize payloads.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). Round-trip encoding must produce identical values.

pub mod notify;
pub mod room;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads
///
/// The payload type is determined by the `Opcode` in the frame header,
/// so we serialize only the inner struct content (no variant tag in CBOR).
///
/// # Invariants
///
/// - Opcode Uniqueness: Each payload variant corresponds to exactly one
///   `Opcode`. The `opcode()` method returns a unique opcode for each variant.
/// - Serialization Consistency: Encoding a `Payload` and then decoding it with
///   the same opcode MUST produce an equivalent value.
///
/// No variant tag goes on the wire: the header's `opcode` already identifies
/// the payload type, so a mismatched opcode/payload pair cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Session management
    /// Initial handshake
    Hello(session::Hello),
    /// Server response to Hello
    HelloReply(session::HelloReply),
    /// Graceful disconnect
    Goodbye(session::Goodbye),
    /// Ping for keepalive
    Ping,
    /// Pong response
    Pong,

    // Room subscription
    /// Subscribe to the room in the header (no payload fields)
    Subscribe,
    /// Subscription granted, carries the resync hint
    SubscribeAck(room::SubscribeAck),
    /// Unsubscribe from the room in the header (idempotent)
    Unsubscribe,
    /// Unsubscription acknowledged
    UnsubscribeAck,

    // Messaging
    /// Post a message to the room in the header
    PostMessage(room::PostMessage),
    /// Synchronous acknowledgment carrying the persisted message
    MessageAck(room::ChatMessage),
    /// Live push of a persisted message to room subscribers
    MessageEvent(room::ChatMessage),

    // Resync pull path
    /// Client sync request
    SyncRequest(room::SyncRequest),
    /// Server sync response
    SyncResponse(room::SyncResponse),

    // Notifications
    /// User-channel push of a persisted notification
    Notification(notify::Notification),

    // Error frame
    /// Error response
    Error(ErrorPayload),
}

/// Error payload for error frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
    /// True when retrying the same request may succeed.
    pub retryable: bool,
}

impl ErrorPayload {
    /// Credential failed verification (bad signature, expired, guest
    /// disabled).
    pub const AUTH_FAILED: u16 = 0x0001;
    /// Operation requires an authenticated connection.
    pub const UNAUTHENTICATED: u16 = 0x0002;
    /// Caller is not a member of the room.
    pub const FORBIDDEN: u16 = 0x0003;
    /// Request was well-formed but semantically invalid.
    pub const INVALID_ARGUMENT: u16 = 0x0004;
    /// Collaborator store failed; safe to retry.
    pub const STORE_UNAVAILABLE: u16 = 0x0005;
    /// Malformed or unexpected frame.
    pub const PROTOCOL: u16 = 0x0006;

    /// Create an authentication failure error.
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self { code: Self::AUTH_FAILED, message: reason.into(), retryable: false }
    }

    /// Create an unauthenticated error.
    #[must_use]
    pub fn unauthenticated() -> Self {
        Self {
            code: Self::UNAUTHENTICATED,
            message: "connection is not authenticated".to_string(),
            retryable: false,
        }
    }

    /// Create a membership denial error.
    pub fn forbidden(room_id: u64) -> Self {
        Self {
            code: Self::FORBIDDEN,
            message: format!("not a member of room {room_id}"),
            retryable: false,
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self { code: Self::INVALID_ARGUMENT, message: msg.into(), retryable: false }
    }

    /// Create a store failure error (retryable).
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self { code: Self::STORE_UNAVAILABLE, message: msg.into(), retryable: true }
    }

    /// Create a protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self { code: Self::PROTOCOL, message: msg.into(), retryable: false }
    }
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::HelloReply(_) => Opcode::HelloReply,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Ping => Opcode::Ping,
            Self::Pong => Opcode::Pong,
            Self::Subscribe => Opcode::Subscribe,
            Self::SubscribeAck(_) => Opcode::SubscribeAck,
            Self::Unsubscribe => Opcode::Unsubscribe,
            Self::UnsubscribeAck => Opcode::UnsubscribeAck,
            Self::PostMessage(_) => Opcode::PostMessage,
            Self::MessageAck(_) => Opcode::MessageAck,
            Self::MessageEvent(_) => Opcode::MessageEvent,
            Self::SyncRequest(_) => Opcode::SyncRequest,
            Self::SyncResponse(_) => Opcode::SyncResponse,
            Self::Notification(_) => Opcode::Notification,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Encode payload to buffer
    ///
    /// Serializes only the inner struct, NOT the variant tag. The frame
    /// header's opcode already identifies the payload type. Size validation
    /// happens later in [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            // Zero-byte payloads
            Self::Ping | Self::Pong | Self::Subscribe | Self::Unsubscribe | Self::UnsubscribeAck => {
                Ok(())
            },
            Self::SubscribeAck(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::PostMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::MessageAck(inner) | Self::MessageEvent(inner) => {
                ciborium::ser::into_writer(inner, &mut writer)
            },
            Self::SyncRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SyncResponse(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Notification(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::PayloadEncode(e.to_string()))
    }

    /// Decode payload from bytes based on opcode
    ///
    /// The size check happens BEFORE CBOR parsing begins, so the parser
    /// never processes inputs past the protocol limit.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::PayloadDecode` if CBOR deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        fn read<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::PayloadDecode(e.to_string()))
        }

        let payload = match opcode {
            Opcode::Hello => Self::Hello(read(bytes)?),
            Opcode::HelloReply => Self::HelloReply(read(bytes)?),
            Opcode::Goodbye => Self::Goodbye(read(bytes)?),
            Opcode::Ping => Self::Ping,
            Opcode::Pong => Self::Pong,
            Opcode::Subscribe => Self::Subscribe,
            Opcode::SubscribeAck => Self::SubscribeAck(read(bytes)?),
            Opcode::Unsubscribe => Self::Unsubscribe,
            Opcode::UnsubscribeAck => Self::UnsubscribeAck,
            Opcode::PostMessage => Self::PostMessage(read(bytes)?),
            Opcode::MessageAck => Self::MessageAck(read(bytes)?),
            Opcode::MessageEvent => Self::MessageEvent(read(bytes)?),
            Opcode::SyncRequest => Self::SyncRequest(read(bytes)?),
            Opcode::SyncResponse => Self::SyncResponse(read(bytes)?),
            Opcode::Notification => Self::Notification(read(bytes)?),
            Opcode::Error => Self::Error(read(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame
    ///
    /// Encodes the payload to CBOR bytes, sets the correct opcode in the
    /// header, and creates a Frame with automatic `payload_size` calculation.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadEncode` if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Parse payload from a raw transport frame
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the header's opcode is not in the
    ///   catalog
    /// - `ProtocolError::PayloadDecode` if CBOR deserialization fails
    /// - `ProtocolError::PayloadTooLarge` if payload exceeds maximum size
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}
