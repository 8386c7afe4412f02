//! User-channel notification payload types.
//!
//! Notifications are addressed to a user, not a room: the server persists
//! the row first, then pushes one frame per live connection the recipient
//! holds. The header's `recipient_id` carries the routing target.

use serde::{Deserialize, Serialize};

/// A persisted notification row, pushed over the recipient's user channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Per-recipient sequence number assigned at persist time.
    pub notification_id: u64,

    /// User this notification is addressed to.
    pub recipient_id: u64,

    /// What happened.
    pub kind: NotificationKind,

    /// Persist-time wall clock, unix milliseconds.
    pub created_at_ms: u64,
}

/// Closed catalog of notification kinds.
///
/// Serialized with an internal `kind` tag so each variant's fields stay
/// flat in the encoded map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    /// Someone asked to join a group the recipient administers.
    JoinRequest {
        /// Group the request targets.
        group_id: u64,
        /// User who asked to join.
        requester_id: u64,
    },

    /// The recipient's join request was accepted.
    RequestAccepted {
        /// Group the recipient was admitted to.
        group_id: u64,
    },

    /// Free-form broadcast text.
    Announcement {
        /// Announcement body.
        text: String,
    },
}
