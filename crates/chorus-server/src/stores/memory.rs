use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use chorus_proto::payloads::{
    notify::{Notification, NotificationKind},
    room::ChatMessage,
};

use super::{MembershipStore, MessageLog, NotificationStore, StoreError};

/// In-memory store implementation for development and testing.
///
/// Uses `HashMap` for fast lookups and `Vec` for ordered rows. All state is
/// wrapped in `Arc<Mutex<>>` to allow Clone and concurrent access.
/// Thread-safe through Mutex, but uses `lock().expect()` which will panic
/// if the mutex is poisoned - acceptable for test code. Message ids follow
/// from row position, so appends are O(1) and reads O(limit).
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

struct MemoryStoreInner {
    /// Room ID → member user IDs
    members: HashMap<u64, HashSet<u64>>,

    /// Messages organized by room, stored in `message_id` order
    /// (`message_id` = position + 1)
    messages: HashMap<u64, Vec<ChatMessage>>,

    /// Notifications organized by recipient, in `notification_id` order
    notifications: HashMap<u64, Vec<Notification>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStoreInner {
                members: HashMap::new(),
                messages: HashMap::new(),
                notifications: HashMap::new(),
            })),
        }
    }

    /// Number of rooms with stored messages.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock). This is acceptable for test code.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").messages.len()
    }

    /// Total number of messages across all rooms.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for
    /// test code.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn total_message_count(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.messages.values().map(Vec::len).sum()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)] // Mutex poisoning panics are acceptable for test code
impl MembershipStore for MemoryStore {
    fn is_member(&self, room_id: u64, user_id: u64) -> Result<bool, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.members.get(&room_id).is_some_and(|m| m.contains(&user_id)))
    }

    fn add_member(&self, room_id: u64, user_id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.members.entry(room_id).or_default().insert(user_id);
        Ok(())
    }

    fn remove_member(&self, room_id: u64, user_id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        if let Some(members) = inner.members.get_mut(&room_id) {
            members.remove(&user_id);
            if members.is_empty() {
                inner.members.remove(&room_id);
            }
        }
        Ok(())
    }

    fn list_members(&self, room_id: u64) -> Result<Vec<u64>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.members.get(&room_id).map_or_else(Vec::new, |m| m.iter().copied().collect()))
    }
}

#[allow(clippy::expect_used)] // Mutex poisoning panics are acceptable for test code
impl MessageLog for MemoryStore {
    fn append(
        &self,
        room_id: u64,
        author_id: u64,
        body: &str,
        created_at_ms: u64,
    ) -> Result<ChatMessage, StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let messages = inner.messages.entry(room_id).or_default();

        debug_assert!(messages.len() < u64::MAX as usize);
        let message_id = messages.len() as u64 + 1;

        let message = ChatMessage {
            message_id,
            room_id,
            author_id,
            body: body.to_string(),
            created_at_ms,
        };
        messages.push(message.clone());

        debug_assert_eq!(messages.len() as u64, message_id);

        Ok(message)
    }

    fn read_from(
        &self,
        room_id: u64,
        from_message_id: u64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some(messages) = inner.messages.get(&room_id) else {
            return Ok(Vec::new());
        };

        // message_id = position + 1, so the cursor is also the start index
        let start = (from_message_id as usize).min(messages.len());
        let end = start.saturating_add(limit).min(messages.len());

        Ok(messages[start..end].to_vec())
    }

    fn latest_message_id(&self, room_id: u64) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner.messages.get(&room_id).and_then(|messages| {
            if messages.is_empty() { None } else { Some(messages.len() as u64) }
        }))
    }
}

#[allow(clippy::expect_used)] // Mutex poisoning panics are acceptable for test code
impl NotificationStore for MemoryStore {
    fn append_notification(
        &self,
        recipient_id: u64,
        kind: NotificationKind,
        created_at_ms: u64,
    ) -> Result<Notification, StoreError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let rows = inner.notifications.entry(recipient_id).or_default();
        let notification_id = rows.len() as u64 + 1;

        let notification = Notification { notification_id, recipient_id, kind, created_at_ms };
        rows.push(notification.clone());

        Ok(notification)
    }

    fn read_for(&self, recipient_id: u64, limit: usize) -> Result<Vec<Notification>, StoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some(rows) = inner.notifications.get(&recipient_id) else {
            return Ok(Vec::new());
        };

        Ok(rows.iter().rev().take(limit).cloned().collect())
    }
}
