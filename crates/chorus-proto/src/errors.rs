//! Protocol error types.

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Buffer shorter than the fixed header size
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Number of bytes available
        actual: usize,
    },

    /// Magic number mismatch
    #[error("invalid magic number")]
    InvalidMagic,

    /// Protocol version not supported by this build
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Header claims a payload larger than the protocol allows
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Claimed payload size
        size: usize,
        /// Protocol maximum
        max: usize,
    },

    /// Buffer ends before the payload the header claims
    #[error("frame truncated: header claims {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload size claimed by the header
        expected: usize,
        /// Payload bytes actually present
        actual: usize,
    },

    /// Opcode not in the protocol catalog
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// CBOR serialization failure
    #[error("payload encode failed: {0}")]
    PayloadEncode(String),

    /// CBOR deserialization failure
    #[error("payload decode failed: {0}")]
    PayloadDecode(String),
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
