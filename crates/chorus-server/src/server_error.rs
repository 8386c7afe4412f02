//! Driver error types.
//!
//! Failures from `ServerDriver` event processing. Authorization and store
//! failures are not driver errors: the driver turns those into wire Error
//! frames for the offending session and keeps running. Only states the
//! driver cannot recover for a session surface here.

use std::fmt;

use crate::stores::StoreError;

/// Errors that can occur during driver event processing.
#[derive(Debug)]
pub enum DriverError {
    /// Session not found in the registry.
    ///
    /// A frame or event referenced a session the driver does not know.
    /// Usually a race with disconnect; the runtime drops the event.
    SessionNotFound(u64),

    /// Connection state machine rejected the operation.
    ///
    /// The session sent a frame invalid for its lifecycle state or its
    /// machine hit a terminal state. Fatal for that connection only.
    Connection {
        /// Session that failed
        session_id: u64,
        /// Error message
        reason: String,
    },

    /// Store operation failed in a context with no session to answer.
    ///
    /// Wraps store failures from server-initiated work (notification
    /// persist). Transient store errors may succeed on retry.
    Store(StoreError),

    /// Frame encoding/decoding error.
    ///
    /// Failed to encode a response frame. Indicates a bug, not client
    /// misbehavior; inbound decode failures become wire Error frames.
    Protocol(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::Connection { session_id, reason } => {
                write!(f, "connection failed for session {session_id}: {reason}")
            },
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for DriverError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<chorus_proto::ProtocolError> for DriverError {
    fn from(err: chorus_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
