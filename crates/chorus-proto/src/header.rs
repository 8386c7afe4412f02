//! Frame header implementation with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 64-byte structure serialized as raw
//! binary (Big Endian). The server routes frames off the header alone,
//! without touching the CBOR payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 64-byte frame header (Big Endian network byte order)
///
/// All multi-byte integers are stored in Big Endian format to match network
/// byte order. Fields are stored as raw byte arrays to avoid alignment issues.
///
/// The header fits exactly one 64-byte CPU cache line, so routing a frame
/// (room fan-out, user-channel target, ordering) touches a single line and
/// never deserializes the payload.
///
/// The `#[repr(C, packed)]` layout with zerocopy traits ensures this struct
/// can be safely cast from untrusted network bytes. All 64-byte patterns are
/// valid, so parsing arbitrary input cannot cause undefined behavior.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    // Protocol identification (8 bytes: 0-7)
    magic: [u8; 4],             // 0x43485253 ("CHRS" in ASCII)
    version: u8,                // 0x01
    flags: u8,                  // reserved, must be zero
    pub(crate) opcode: [u8; 2], // u16 operation code

    // Request/payload metadata (8 bytes: 8-15)
    request_id: [u8; 4], // u32 client nonce for request/response correlation
    pub(crate) payload_size: [u8; 4], // u32 payload length

    // Routing context (16 bytes: 16-31)
    room_id: [u8; 8],   // u64 room identifier
    sender_id: [u8; 8], // u64 authenticated user id of the sender

    // Ordering and user-channel routing (16 bytes: 32-47)
    message_id: [u8; 8], // u64 per-room sequence; 0 until the log assigns one
    recipient_id: [u8; 8], // u64 user-channel target (notification frames)

    // Timestamps and padding (16 bytes: 48-63)
    timestamp_ms: [u8; 8], // u64 unix millis, set at persist time
    reserved: [u8; 8],     // must be zero
}

impl FrameHeader {
    /// Size of the serialized header (64 bytes, one cache line)
    pub const SIZE: usize = 64;

    /// Magic number: "CHRS" in ASCII (0x43485253)
    pub const MAGIC: u32 = 0x4348_5253;

    /// Current protocol version
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (1 MB)
    pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

    /// Create a new header with the specified opcode.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&Self::MAGIC.to_be_bytes());
        bytes[4] = Self::VERSION;
        bytes[6..8].copy_from_slice(&opcode.to_u16().to_be_bytes());

        // INVARIANT: bytes were just constructed with valid magic and version,
        // so from_bytes cannot fail.
        Self::from_bytes(&bytes)
            .ok()
            .unwrap_or_else(|| unreachable!("constructed valid header with correct magic/version"))
            .to_owned()
    }

    /// Parse header from network bytes (zero-copy, safe)
    ///
    /// Casts raw bytes directly to a `FrameHeader` reference using
    /// compile-time layout verification from `zerocopy`. No data is copied.
    ///
    /// Validation order is cheapest-first: size, magic, version, payload
    /// size. This fails fast on garbage data.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if buffer is too short (< 64 bytes)
    /// - `ProtocolError::InvalidMagic` if magic number is invalid
    /// - `ProtocolError::UnsupportedVersion` if protocol version is unsupported
    /// - `ProtocolError::PayloadTooLarge` if payload size exceeds maximum
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes (zero-copy)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Protocol magic number (0x43485253 = "CHRS").
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte (currently 0x01).
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Client-assigned nonce for request/response correlation.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        u32::from_be_bytes(self.request_id)
    }

    /// Room identifier.
    #[must_use]
    pub fn room_id(&self) -> u64 {
        u64::from_be_bytes(self.room_id)
    }

    /// Authenticated user id of the frame's sender.
    #[must_use]
    pub fn sender_id(&self) -> u64 {
        u64::from_be_bytes(self.sender_id)
    }

    /// Per-room sequence number assigned by the message log.
    ///
    /// Zero until the log has persisted the message.
    #[must_use]
    pub fn message_id(&self) -> u64 {
        u64::from_be_bytes(self.message_id)
    }

    /// User-channel target for notification frames.
    #[must_use]
    pub fn recipient_id(&self) -> u64 {
        u64::from_be_bytes(self.recipient_id)
    }

    /// Wall-clock timestamp in unix milliseconds, set at persist time.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        u64::from_be_bytes(self.timestamp_ms)
    }

    /// Payload size in bytes (max 1 MB).
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Update room identifier.
    pub fn set_room_id(&mut self, room_id: u64) {
        self.room_id = room_id.to_be_bytes();
    }

    /// Update sender identifier.
    pub fn set_sender_id(&mut self, sender_id: u64) {
        self.sender_id = sender_id.to_be_bytes();
    }

    /// Assign the log's sequence number (server use only).
    pub fn set_message_id(&mut self, message_id: u64) {
        self.message_id = message_id.to_be_bytes();
    }

    /// Set user-channel routing target for notification frames.
    pub fn set_recipient_id(&mut self, recipient_id: u64) {
        self.recipient_id = recipient_id.to_be_bytes();
    }

    /// Set persist-time wall-clock timestamp.
    pub fn set_timestamp_ms(&mut self, timestamp_ms: u64) {
        self.timestamp_ms = timestamp_ms.to_be_bytes();
    }

    /// Set client request nonce for response correlation.
    pub fn set_request_id(&mut self, request_id: u32) {
        self.request_id = request_id.to_be_bytes();
    }

    /// Set payload size.
    pub fn set_payload_size(&mut self, size: u32) {
        self.payload_size = size.to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("request_id", &self.request_id())
            .field("room_id", &self.room_id())
            .field("sender_id", &self.sender_id())
            .field("message_id", &self.message_id())
            .field("recipient_id", &self.recipient_id())
            .field("timestamp_ms", &self.timestamp_ms())
            .field("payload_size", &self.payload_size())
            .finish_non_exhaustive()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}
