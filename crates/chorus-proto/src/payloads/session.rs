//! Session management payload types.
//!
//! The handshake and teardown messages: Hello/HelloReply carry the
//! credential exchange, Goodbye carries a close reason.

use serde::{Deserialize, Serialize};

/// Initial handshake, first frame on every connection.
///
/// The credential is an opaque string: either a signed bearer token or the
/// reserved guest sentinel. The server never echoes it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Client protocol version, must match the server's.
    pub version: u8,

    /// Bearer credential presented for authentication.
    pub credential: String,
}

/// Server response to a successful Hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Server-assigned session identifier for this connection.
    pub session_id: u64,

    /// Authenticated user identity bound to the connection.
    pub user_id: u64,

    /// True when the connection authenticated via the guest sentinel.
    pub guest: bool,
}

/// Graceful disconnect, sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Human-readable close reason.
    pub reason: String,
}
