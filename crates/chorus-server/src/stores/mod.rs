//! Collaborator store abstractions.
//!
//! Trait-based abstraction over the three persistence concerns the delivery
//! core depends on: room membership, the per-room message log, and
//! per-recipient notification rows. The traits are synchronous (no async)
//! to maintain a clean synchronous API design; implementations typically
//! share internal state via Arc, so clones access the same underlying
//! store.
//!
//! The message log is the single source of truth for ordering: `append`
//! atomically assigns the next strictly-increasing `message_id` for its
//! room. The delivery core never assigns or guesses ids.

mod error;
mod memory;
mod redb;

use chorus_proto::payloads::{
    notify::{Notification, NotificationKind},
    room::ChatMessage,
};
pub use error::StoreError;
pub use memory::MemoryStore;

pub use self::redb::RedbStore;

/// Room membership, the authorization source of truth.
///
/// Membership is checked fresh at every authorization decision (subscribe,
/// post, sync); the delivery core never caches results.
pub trait MembershipStore: Clone + Send + Sync + 'static {
    /// Whether `user_id` is currently a member of `room_id`.
    fn is_member(&self, room_id: u64, user_id: u64) -> Result<bool, StoreError>;

    /// Add a member to a room. Idempotent.
    fn add_member(&self, room_id: u64, user_id: u64) -> Result<(), StoreError>;

    /// Remove a member from a room. Idempotent.
    fn remove_member(&self, room_id: u64, user_id: u64) -> Result<(), StoreError>;

    /// All current members of a room. Order is not guaranteed.
    fn list_members(&self, room_id: u64) -> Result<Vec<u64>, StoreError>;
}

/// Append-only per-room message log.
pub trait MessageLog: Clone + Send + Sync + 'static {
    /// Atomically persist a message and assign its `message_id`.
    ///
    /// Ids are strictly increasing per room, starting at 1, with no reuse
    /// even across restarts. Returns the persisted row.
    fn append(
        &self,
        room_id: u64,
        author_id: u64,
        body: &str,
        created_at_ms: u64,
    ) -> Result<ChatMessage, StoreError>;

    /// Read messages with `message_id` strictly greater than
    /// `from_message_id`, ascending, at most `limit`.
    ///
    /// Pass 0 to read from the beginning. An unknown room reads as empty.
    fn read_from(
        &self,
        room_id: u64,
        from_message_id: u64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Highest assigned `message_id` for a room. `None` if the room's log
    /// is empty.
    fn latest_message_id(&self, room_id: u64) -> Result<Option<u64>, StoreError>;
}

/// Per-recipient notification rows, the fallback of record for offline
/// users.
pub trait NotificationStore: Clone + Send + Sync + 'static {
    /// Atomically persist a notification and assign its
    /// `notification_id` (strictly increasing per recipient, starting at
    /// 1). Returns the persisted row.
    fn append_notification(
        &self,
        recipient_id: u64,
        kind: NotificationKind,
        created_at_ms: u64,
    ) -> Result<Notification, StoreError>;

    /// Most recent notifications for a recipient, descending by
    /// `notification_id`, at most `limit`.
    fn read_for(&self, recipient_id: u64, limit: usize) -> Result<Vec<Notification>, StoreError>;
}

/// Everything the delivery core needs from persistence, in one bound.
pub trait DataStore: MembershipStore + MessageLog + NotificationStore {}

impl<T: MembershipStore + MessageLog + NotificationStore> DataStore for T {}
