//! User-channel notification delivery.
//!
//! Notifications target a user, not a room: the driver fans a persisted
//! notification out to every live session on the recipient's user channel.
//! Persistence always happens first, so an offline recipient finds the row
//! waiting in the store.

use chorus_proto::payloads::notify::{Notification, NotificationKind};

use crate::stores::{NotificationStore, StoreError};

/// Persists notifications for user-channel fan-out.
#[derive(Debug, Clone)]
pub struct Notifier<S> {
    store: S,
}

impl<S> Notifier<S>
where
    S: NotificationStore,
{
    /// Create a notifier over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persist a notification for a recipient.
    ///
    /// Returns the persisted row with its assigned `notification_id`. The
    /// caller pushes it to the recipient's live sessions; if the persist
    /// fails, nothing is pushed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the row could not be persisted.
    pub fn notify(
        &self,
        recipient_id: u64,
        kind: NotificationKind,
        created_at_ms: u64,
    ) -> Result<Notification, StoreError> {
        self.store.append_notification(recipient_id, kind, created_at_ms)
    }

    /// Most recent notifications for a recipient, newest first.
    ///
    /// The pull path for clients that were offline when the push happened.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on store failure.
    pub fn recent(&self, recipient_id: u64, limit: usize) -> Result<Vec<Notification>, StoreError> {
        self.store.read_for(recipient_id, limit)
    }
}
