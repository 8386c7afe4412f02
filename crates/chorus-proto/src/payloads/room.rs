//! Room messaging payload types.
//!
//! Subscription acknowledgments, message posting, live message events, and
//! the pull-path resync exchange. The room itself is identified by the
//! frame header's `room_id`; payloads carry only what the header cannot.

use serde::{Deserialize, Serialize};

/// A persisted chat message, the unit of delivery.
///
/// `message_id` is assigned by the message log at append time and is
/// strictly increasing within a room. Clients order and de-duplicate by it;
/// arrival order carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Per-room sequence number, starts at 1.
    pub message_id: u64,

    /// Room this message belongs to.
    pub room_id: u64,

    /// Authenticated user id of the author.
    pub author_id: u64,

    /// Message text.
    pub body: String,

    /// Persist-time wall clock, unix milliseconds.
    pub created_at_ms: u64,
}

/// Subscription granted.
///
/// `latest_message_id` is the room's highest assigned sequence number at
/// subscribe time (`None` for an empty room), so the client can immediately
/// decide whether it needs a resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeAck {
    /// Highest `message_id` in the room's log, if any.
    pub latest_message_id: Option<u64>,
}

/// Post a message to the room named in the frame header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessage {
    /// Message text, must be non-empty.
    pub body: String,
}

/// Pull-path request for a room's message log.
///
/// Returns messages with `message_id` strictly greater than
/// `from_message_id`, ascending. Pass 0 to read from the beginning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Exclusive lower bound on `message_id`.
    pub from_message_id: u64,

    /// Maximum number of messages to return.
    pub limit: u32,
}

/// Pull-path response, ascending by `message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Messages after the requested cursor, ascending.
    pub messages: Vec<ChatMessage>,

    /// True when the log holds more messages past the last one returned.
    pub has_more: bool,
}
