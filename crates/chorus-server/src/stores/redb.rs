//! Redb-backed durable store implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! All rows survive server restarts; the next `message_id` for a room is
//! recovered from the highest key in its range, so ids stay strictly
//! increasing across restarts.

use std::{path::Path, sync::Arc};

use chorus_proto::payloads::{
    notify::{Notification, NotificationKind},
    room::ChatMessage,
};
use redb::{Database, ReadableTable, TableDefinition};

use super::{MembershipStore, MessageLog, NotificationStore, StoreError};

/// Table: messages
/// Key: (room_id: u64, message_id: u64) as big-endian bytes [16 bytes]
/// Value: CBOR-encoded ChatMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: notifications
/// Key: (recipient_id: u64, notification_id: u64) as big-endian bytes
/// Value: CBOR-encoded Notification
const NOTIFICATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("notifications");

/// Table: members
/// Key: (room_id: u64, user_id: u64) as big-endian bytes
/// Value: empty
const MEMBERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("members");

/// Durable store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (MESSAGES, NOTIFICATIONS,
    /// MEMBERS).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the database cannot be opened or
    /// created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(|e| StoreError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(MESSAGES).map_err(|e| StoreError::Io(e.to_string()))?;
            let _ = txn.open_table(NOTIFICATIONS).map_err(|e| StoreError::Io(e.to_string()))?;
            let _ = txn.open_table(MEMBERS).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Find the highest sequence number in a prefix's key range.
    fn highest_seq<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        prefix: u64,
    ) -> Result<Option<u64>, StoreError> {
        let start_key = encode_key(prefix, 0);
        let end_key = encode_key(prefix, u64::MAX);

        let mut results = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StoreError::Io(e.to_string()))?;

        match results.next_back() {
            Some(result) => {
                let (key, _) = result.map_err(|e| StoreError::Io(e.to_string()))?;
                let (_, seq) = decode_key(key.value());
                Ok(Some(seq))
            },
            None => Ok(None),
        }
    }
}

impl MembershipStore for RedbStore {
    fn is_member(&self, room_id: u64, user_id: u64) -> Result<bool, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;
        let table = txn.open_table(MEMBERS).map_err(|e| StoreError::Io(e.to_string()))?;

        let key = encode_key(room_id, user_id);
        Ok(table.get(key.as_slice()).map_err(|e| StoreError::Io(e.to_string()))?.is_some())
    }

    fn add_member(&self, room_id: u64, user_id: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(MEMBERS).map_err(|e| StoreError::Io(e.to_string()))?;

            let key = encode_key(room_id, user_id);
            table.insert(key.as_slice(), [].as_slice()).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(())
    }

    fn remove_member(&self, room_id: u64, user_id: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(MEMBERS).map_err(|e| StoreError::Io(e.to_string()))?;

            let key = encode_key(room_id, user_id);
            table.remove(key.as_slice()).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(())
    }

    fn list_members(&self, room_id: u64) -> Result<Vec<u64>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;
        let table = txn.open_table(MEMBERS).map_err(|e| StoreError::Io(e.to_string()))?;

        let start_key = encode_key(room_id, 0);
        let end_key = encode_key(room_id, u64::MAX);

        let results = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let mut members = Vec::new();
        for result in results {
            let (key, _) = result.map_err(|e| StoreError::Io(e.to_string()))?;
            let (_, user_id) = decode_key(key.value());
            members.push(user_id);
        }

        Ok(members)
    }
}

impl MessageLog for RedbStore {
    fn append(
        &self,
        room_id: u64,
        author_id: u64,
        body: &str,
        created_at_ms: u64,
    ) -> Result<ChatMessage, StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;

        // The write transaction serializes appends, so read-then-insert
        // cannot race and ids stay gapless and strictly increasing.
        let message = {
            let mut table = txn.open_table(MESSAGES).map_err(|e| StoreError::Io(e.to_string()))?;

            let message_id = Self::highest_seq(&table, room_id)?.unwrap_or(0).saturating_add(1);

            let message = ChatMessage {
                message_id,
                room_id,
                author_id,
                body: body.to_string(),
                created_at_ms,
            };

            let mut bytes = Vec::new();
            ciborium::into_writer(&message, &mut bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let key = encode_key(room_id, message_id);
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StoreError::Io(e.to_string()))?;

            message
        };

        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(message)
    }

    fn read_from(
        &self,
        room_id: u64,
        from_message_id: u64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StoreError::Io(e.to_string()))?;

        // Exclusive cursor: start one past the requested id
        let start_key = encode_key(room_id, from_message_id.saturating_add(1));
        let end_key = encode_key(room_id, u64::MAX);

        let results = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let mut messages = Vec::with_capacity(limit);
        for result in results {
            if messages.len() >= limit {
                break;
            }

            let (_, value) = result.map_err(|e| StoreError::Io(e.to_string()))?;
            let message: ChatMessage = ciborium::from_reader(value.value())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            messages.push(message);
        }

        Ok(messages)
    }

    fn latest_message_id(&self, room_id: u64) -> Result<Option<u64>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StoreError::Io(e.to_string()))?;

        Self::highest_seq(&table, room_id)
    }
}

impl NotificationStore for RedbStore {
    fn append_notification(
        &self,
        recipient_id: u64,
        kind: NotificationKind,
        created_at_ms: u64,
    ) -> Result<Notification, StoreError> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Io(e.to_string()))?;

        let notification = {
            let mut table =
                txn.open_table(NOTIFICATIONS).map_err(|e| StoreError::Io(e.to_string()))?;

            let notification_id =
                Self::highest_seq(&table, recipient_id)?.unwrap_or(0).saturating_add(1);

            let notification = Notification { notification_id, recipient_id, kind, created_at_ms };

            let mut bytes = Vec::new();
            ciborium::into_writer(&notification, &mut bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let key = encode_key(recipient_id, notification_id);
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StoreError::Io(e.to_string()))?;

            notification
        };

        txn.commit().map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(notification)
    }

    fn read_for(&self, recipient_id: u64, limit: usize) -> Result<Vec<Notification>, StoreError> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Io(e.to_string()))?;
        let table = txn.open_table(NOTIFICATIONS).map_err(|e| StoreError::Io(e.to_string()))?;

        let start_key = encode_key(recipient_id, 0);
        let end_key = encode_key(recipient_id, u64::MAX);

        let results = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StoreError::Io(e.to_string()))?;

        // Most recent first
        let mut notifications = Vec::with_capacity(limit);
        for result in results.rev() {
            if notifications.len() >= limit {
                break;
            }

            let (_, value) = result.map_err(|e| StoreError::Io(e.to_string()))?;
            let notification: Notification = ciborium::from_reader(value.value())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            notifications.push(notification);
        }

        Ok(notifications)
    }
}

/// Encode (prefix, seq) as 16-byte big-endian key.
///
/// Layout: [prefix: 8 bytes BE][seq: 8 bytes BE]. Lexicographic ordering
/// matches numeric ordering, so range scans walk ids in order.
fn encode_key(prefix: u64, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&prefix.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Decode key back to (prefix, seq).
fn decode_key(key: &[u8]) -> (u64, u64) {
    debug_assert_eq!(key.len(), 16);
    let prefix = u64::from_be_bytes(key[..8].try_into().unwrap_or_default());
    let seq = u64::from_be_bytes(key[8..].try_into().unwrap_or_default());
    (prefix, seq)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn key_encoding_round_trip() {
        let key = encode_key(0x1234_5678_9ABC_DEF0, 42);
        assert_eq!(key.len(), 16);

        let (prefix, seq) = decode_key(&key);
        assert_eq!(prefix, 0x1234_5678_9ABC_DEF0);
        assert_eq!(seq, 42);
    }

    #[test]
    fn append_assigns_sequential_ids() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        for expected_id in 1..=3 {
            let message = store.append(100, 1, "hello", 0).unwrap();
            assert_eq!(message.message_id, expected_id);
        }

        assert_eq!(store.latest_message_id(100).unwrap(), Some(3));
    }

    #[test]
    fn latest_message_id_empty_room() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        assert_eq!(store.latest_message_id(999).unwrap(), None);
    }

    #[test]
    fn read_from_pagination() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        for i in 0..20 {
            store.append(100, 1, &format!("msg {i}"), 0).unwrap();
        }

        let batch1 = store.read_from(100, 0, 10).unwrap();
        assert_eq!(batch1.len(), 10);
        assert_eq!(batch1[0].message_id, 1);
        assert_eq!(batch1[9].message_id, 10);

        let batch2 = store.read_from(100, 10, 10).unwrap();
        assert_eq!(batch2.len(), 10);
        assert_eq!(batch2[0].message_id, 11);
        assert_eq!(batch2[9].message_id, 20);

        let batch3 = store.read_from(100, 20, 10).unwrap();
        assert_eq!(batch3.len(), 0);
    }

    #[test]
    fn rooms_do_not_bleed_into_each_other() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store.append(100, 1, "room 100", 0).unwrap();
        store.append(101, 2, "room 101", 0).unwrap();

        let messages = store.read_from(100, 0, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "room 100");
        assert_eq!(messages[0].room_id, 100);
    }

    #[test]
    fn message_row_round_trip() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let stored = store.append(7, 3, "hello world", 1_700_000_000_000).unwrap();

        let loaded = store.read_from(7, 0, 10).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], stored);
        assert_eq!(loaded[0].author_id, 3);
        assert_eq!(loaded[0].created_at_ms, 1_700_000_000_000);
    }

    #[test]
    fn ids_survive_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store.append(7, 1, "before restart", 0).unwrap();
            store.append(7, 1, "also before", 0).unwrap();
        }

        // Reopen: the next id continues after the highest persisted one
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.latest_message_id(7).unwrap(), Some(2));

        let message = store.append(7, 1, "after restart", 0).unwrap();
        assert_eq!(message.message_id, 3);
    }

    #[test]
    fn membership_round_trip() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        assert!(!store.is_member(7, 1).unwrap());

        store.add_member(7, 1).unwrap();
        store.add_member(7, 2).unwrap();
        assert!(store.is_member(7, 1).unwrap());

        assert_eq!(store.list_members(7).unwrap(), vec![1, 2]);

        store.remove_member(7, 1).unwrap();
        assert!(!store.is_member(7, 1).unwrap());
        store.remove_member(7, 1).unwrap(); // Idempotent
    }

    #[test]
    fn notifications_round_trip() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        let n1 = store
            .append_notification(2, NotificationKind::RequestAccepted { group_id: 7 }, 10)
            .unwrap();
        let n2 = store
            .append_notification(
                2,
                NotificationKind::JoinRequest { group_id: 7, requester_id: 3 },
                20,
            )
            .unwrap();

        assert_eq!(n1.notification_id, 1);
        assert_eq!(n2.notification_id, 2);

        let rows = store.read_for(2, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], n2); // Most recent first
        assert_eq!(rows[1], n1);
    }

    #[test]
    fn notifications_survive_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store
                .append_notification(2, NotificationKind::Announcement { text: "hi".into() }, 0)
                .unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let rows = store.read_for(2, 10).unwrap();
        assert_eq!(rows.len(), 1);

        let next = store
            .append_notification(2, NotificationKind::Announcement { text: "again".into() }, 0)
            .unwrap();
        assert_eq!(next.notification_id, 2);
    }
}
