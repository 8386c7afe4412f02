//! Room message posting and resync.
//!
//! `RoomBroadcaster` is the authorization and ordering boundary for room
//! traffic. Every post and sync checks membership fresh against the store
//! (never cached), and every accepted message is persisted before anything
//! is fanned out. The message log assigns ids, so ordering is decided here
//! and nowhere else.

use thiserror::Error;

use crate::stores::{MembershipStore, MessageLog, StoreError};
use chorus_proto::payloads::room::{ChatMessage, SyncResponse};

/// Maximum message body size in bytes.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

/// Maximum messages returned per sync batch.
pub const MAX_SYNC_BATCH: usize = 256;

/// Failures from posting or syncing room messages.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Sender is not a member of the room
    #[error("user {user_id} is not a member of room {room_id}")]
    NotMember {
        /// Room the operation targeted
        room_id: u64,
        /// User that was checked
        user_id: u64,
    },

    /// Message body is empty or whitespace-only
    #[error("message body is empty")]
    EmptyBody,

    /// Message body exceeds [`MAX_BODY_BYTES`]
    #[error("message body too large: {size} bytes (max {max})")]
    BodyTooLarge {
        /// Size of the rejected body
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Posts messages to rooms and serves resync reads.
///
/// Holds a clone of the store; clones share the same backing data.
#[derive(Debug, Clone)]
pub struct RoomBroadcaster<S> {
    store: S,
}

impl<S> RoomBroadcaster<S>
where
    S: MembershipStore + MessageLog,
{
    /// Create a broadcaster over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Validate, authorize, and persist a message.
    ///
    /// Membership is checked fresh at call time. On success the persisted
    /// row is returned with its assigned `message_id`; the caller fans it
    /// out to the room snapshot. Nothing is persisted when validation or
    /// authorization fails.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::EmptyBody` / `BodyTooLarge` for invalid bodies
    /// - `DeliveryError::NotMember` if the author lost (or never had)
    ///   membership
    /// - `DeliveryError::Store` if the membership check or append fails
    pub fn post_message(
        &self,
        room_id: u64,
        author_id: u64,
        body: &str,
        created_at_ms: u64,
    ) -> Result<ChatMessage, DeliveryError> {
        if body.trim().is_empty() {
            return Err(DeliveryError::EmptyBody);
        }
        if body.len() > MAX_BODY_BYTES {
            return Err(DeliveryError::BodyTooLarge { size: body.len(), max: MAX_BODY_BYTES });
        }

        if !self.store.is_member(room_id, author_id)? {
            return Err(DeliveryError::NotMember { room_id, user_id: author_id });
        }

        Ok(self.store.append(room_id, author_id, body, created_at_ms)?)
    }

    /// Serve a resync read: messages after `from_message_id`, ascending.
    ///
    /// The cursor is exclusive; pass 0 to read from the beginning. `limit`
    /// is clamped to [`MAX_SYNC_BATCH`]. `has_more` tells the client
    /// whether another request with the last returned id would yield more
    /// rows.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::NotMember` if the requester is not a member
    /// - `DeliveryError::Store` on store failure
    pub fn handle_sync_request(
        &self,
        room_id: u64,
        user_id: u64,
        from_message_id: u64,
        limit: u32,
    ) -> Result<SyncResponse, DeliveryError> {
        if !self.store.is_member(room_id, user_id)? {
            return Err(DeliveryError::NotMember { room_id, user_id });
        }

        let limit = (limit as usize).clamp(1, MAX_SYNC_BATCH);

        // Read one extra row to learn whether the log continues
        let mut messages = self.store.read_from(room_id, from_message_id, limit + 1)?;
        let has_more = messages.len() > limit;
        messages.truncate(limit);

        Ok(SyncResponse { messages, has_more })
    }

    /// Authorize a subscribe and return the room's resync hint.
    ///
    /// Checks membership fresh, then reads the highest assigned
    /// `message_id` (`None` for an empty log) so the subscriber knows
    /// where its history ends.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::NotMember` if the user is not a member
    /// - `DeliveryError::Store` on store failure
    pub fn subscribe_check(
        &self,
        room_id: u64,
        user_id: u64,
    ) -> Result<Option<u64>, DeliveryError> {
        if !self.store.is_member(room_id, user_id)? {
            return Err(DeliveryError::NotMember { room_id, user_id });
        }

        Ok(self.store.latest_message_id(room_id)?)
    }

    /// Highest assigned `message_id` for a room, the client's resync hint.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on store failure.
    pub fn latest_message_id(&self, room_id: u64) -> Result<Option<u64>, StoreError> {
        self.store.latest_message_id(room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;

    fn broadcaster_with_member() -> RoomBroadcaster<MemoryStore> {
        let store = MemoryStore::new();
        store.add_member(7, 1).unwrap();
        RoomBroadcaster::new(store)
    }

    #[test]
    fn member_can_post() {
        let broadcaster = broadcaster_with_member();

        let message = broadcaster.post_message(7, 1, "hello", 123).unwrap();
        assert_eq!(message.message_id, 1);
        assert_eq!(message.room_id, 7);
        assert_eq!(message.author_id, 1);
        assert_eq!(message.body, "hello");
        assert_eq!(message.created_at_ms, 123);
    }

    #[test]
    fn non_member_post_rejected_and_nothing_persisted() {
        let broadcaster = broadcaster_with_member();

        let result = broadcaster.post_message(7, 99, "intruder", 0);
        assert!(matches!(result, Err(DeliveryError::NotMember { room_id: 7, user_id: 99 })));

        // The log is untouched
        assert_eq!(broadcaster.latest_message_id(7).unwrap(), None);
    }

    #[test]
    fn empty_body_rejected() {
        let broadcaster = broadcaster_with_member();

        assert!(matches!(broadcaster.post_message(7, 1, "", 0), Err(DeliveryError::EmptyBody)));
        assert!(matches!(
            broadcaster.post_message(7, 1, "   \n\t", 0),
            Err(DeliveryError::EmptyBody)
        ));
        assert_eq!(broadcaster.latest_message_id(7).unwrap(), None);
    }

    #[test]
    fn oversized_body_rejected() {
        let broadcaster = broadcaster_with_member();

        let body = "x".repeat(MAX_BODY_BYTES + 1);
        let result = broadcaster.post_message(7, 1, &body, 0);
        assert!(matches!(result, Err(DeliveryError::BodyTooLarge { .. })));
    }

    #[test]
    fn ids_increase_across_posts() {
        let broadcaster = broadcaster_with_member();

        for expected in 1..=5 {
            let message = broadcaster.post_message(7, 1, "msg", 0).unwrap();
            assert_eq!(message.message_id, expected);
        }
    }

    #[test]
    fn sync_pages_with_has_more() {
        let broadcaster = broadcaster_with_member();

        for _ in 0..10 {
            broadcaster.post_message(7, 1, "msg", 0).unwrap();
        }

        let response = broadcaster.handle_sync_request(7, 1, 0, 4).unwrap();
        assert_eq!(response.messages.len(), 4);
        assert!(response.has_more);
        assert_eq!(response.messages[0].message_id, 1);
        assert_eq!(response.messages[3].message_id, 4);

        let last = response.messages[3].message_id;
        let response = broadcaster.handle_sync_request(7, 1, last, 100).unwrap();
        assert_eq!(response.messages.len(), 6);
        assert!(!response.has_more);
        assert_eq!(response.messages[0].message_id, 5);
    }

    #[test]
    fn sync_requires_membership() {
        let broadcaster = broadcaster_with_member();
        broadcaster.post_message(7, 1, "secret", 0).unwrap();

        let result = broadcaster.handle_sync_request(7, 99, 0, 10);
        assert!(matches!(result, Err(DeliveryError::NotMember { .. })));
    }

    #[test]
    fn sync_limit_is_clamped() {
        let broadcaster = broadcaster_with_member();

        for _ in 0..(MAX_SYNC_BATCH + 10) {
            broadcaster.post_message(7, 1, "msg", 0).unwrap();
        }

        // Zero becomes one
        let response = broadcaster.handle_sync_request(7, 1, 0, 0).unwrap();
        assert_eq!(response.messages.len(), 1);
        assert!(response.has_more);

        // Huge limits are capped
        let response = broadcaster.handle_sync_request(7, 1, 0, u32::MAX).unwrap();
        assert_eq!(response.messages.len(), MAX_SYNC_BATCH);
        assert!(response.has_more);
    }

    #[test]
    fn membership_revocation_takes_effect_immediately() {
        let store = MemoryStore::new();
        store.add_member(7, 1).unwrap();
        let broadcaster = RoomBroadcaster::new(store.clone());

        broadcaster.post_message(7, 1, "while member", 0).unwrap();

        store.remove_member(7, 1).unwrap();
        let result = broadcaster.post_message(7, 1, "after removal", 0);
        assert!(matches!(result, Err(DeliveryError::NotMember { .. })));
    }
}
