//! Connection registry for session, room, and user-channel tracking.
//!
//! The registry maintains three mappings: room → sessions (for broadcast),
//! session → rooms (for cleanup on disconnect), and user → sessions (the
//! user channel for notification fan-out). This enables O(1) lookups in
//! every direction.
//!
//! A user may hold many simultaneous connections (several devices), so the
//! user index maps to a set of sessions. Sessions must explicitly subscribe
//! to rooms - no lazy room creation. Deregistering a session removes it
//! from every index and is idempotent.

use std::collections::{HashMap, HashSet};

/// Information about a registered session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// User ID bound to this session (after authentication)
    pub user_id: Option<u64>,
    /// Whether the session authenticated via the guest sentinel
    pub guest: bool,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionInfo {
    /// Create a new unauthenticated session info.
    #[must_use]
    pub fn new() -> Self {
        Self { user_id: None, guest: false }
    }

    /// True once a user identity has been bound.
    #[must_use]
    pub fn authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Registry for tracking sessions, room subscriptions, and user channels.
///
/// All mutations and snapshot reads on one registry instance happen under
/// the caller's serialization boundary (the driver lock). Snapshots are
/// plain `Vec`s so the caller can perform sends after releasing it.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Session ID → session info
    sessions: HashMap<u64, SessionInfo>,
    /// Room ID → set of subscribed session IDs
    room_subscriptions: HashMap<u64, HashSet<u64>>,
    /// Session ID → set of subscribed room IDs
    session_rooms: HashMap<u64, HashSet<u64>>,
    /// User ID → set of session IDs (user channel, many devices per user)
    user_sessions: HashMap<u64, HashSet<u64>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session.
    ///
    /// Returns `false` if the session ID is already registered.
    pub fn register(&mut self, session_id: u64) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }

        self.sessions.insert(session_id, SessionInfo::new());
        self.session_rooms.insert(session_id, HashSet::new());
        true
    }

    /// Bind an authenticated user identity to a session.
    ///
    /// Adds the session to the user's channel. A user may hold any number
    /// of simultaneous sessions. Returns `false` if the session is not
    /// registered or already bound.
    pub fn bind_user(&mut self, session_id: u64, user_id: u64, guest: bool) -> bool {
        let Some(info) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if info.user_id.is_some() {
            return false;
        }

        info.user_id = Some(user_id);
        info.guest = guest;
        self.user_sessions.entry(user_id).or_default().insert(session_id);
        true
    }

    /// Deregister a session and remove it from every index.
    ///
    /// Idempotent: returns `None` without touching anything if the session
    /// is unknown. Otherwise returns the session info and the rooms it was
    /// subscribed to.
    pub fn deregister(&mut self, session_id: u64) -> Option<(SessionInfo, HashSet<u64>)> {
        let info = self.sessions.remove(&session_id)?;
        let rooms = self.session_rooms.remove(&session_id).unwrap_or_default();

        if let Some(user_id) = info.user_id {
            if let Some(channel) = self.user_sessions.get_mut(&user_id) {
                channel.remove(&session_id);
                if channel.is_empty() {
                    self.user_sessions.remove(&user_id);
                }
            }
        }

        for room_id in &rooms {
            if let Some(subscribers) = self.room_subscriptions.get_mut(room_id) {
                subscribers.remove(&session_id);
                if subscribers.is_empty() {
                    self.room_subscriptions.remove(room_id);
                }
            }
        }

        Some((info, rooms))
    }

    /// Session metadata. `None` if session doesn't exist.
    #[must_use]
    pub fn session(&self, session_id: u64) -> Option<&SessionInfo> {
        self.sessions.get(&session_id)
    }

    /// Check if a session is registered.
    #[must_use]
    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Subscribe a session to a room.
    ///
    /// Returns `false` if the session is not registered. Subscribing twice
    /// is a no-op.
    pub fn subscribe(&mut self, session_id: u64, room_id: u64) -> bool {
        if !self.sessions.contains_key(&session_id) {
            return false;
        }

        self.room_subscriptions.entry(room_id).or_default().insert(session_id);
        self.session_rooms.entry(session_id).or_default().insert(room_id);
        true
    }

    /// Unsubscribe a session from a room.
    ///
    /// Returns `true` if the session was subscribed and is now
    /// unsubscribed. Unsubscribing when not subscribed is a no-op.
    pub fn unsubscribe(&mut self, session_id: u64, room_id: u64) -> bool {
        let removed_from_room =
            self.room_subscriptions.get_mut(&room_id).is_some_and(|s| s.remove(&session_id));

        let removed_from_session =
            self.session_rooms.get_mut(&session_id).is_some_and(|r| r.remove(&room_id));

        if self.room_subscriptions.get(&room_id).is_some_and(HashSet::is_empty) {
            self.room_subscriptions.remove(&room_id);
        }

        removed_from_room && removed_from_session
    }

    /// Check if a session is subscribed to a room.
    #[must_use]
    pub fn is_subscribed(&self, session_id: u64, room_id: u64) -> bool {
        self.room_subscriptions.get(&room_id).is_some_and(|s| s.contains(&session_id))
    }

    /// Point-in-time snapshot of the sessions subscribed to a room.
    ///
    /// Later registry mutations do not retroactively change the snapshot;
    /// that is the delivery contract for a single broadcast.
    #[must_use]
    pub fn room_snapshot(&self, room_id: u64) -> Vec<u64> {
        self.room_subscriptions.get(&room_id).map_or_else(Vec::new, |s| s.iter().copied().collect())
    }

    /// Point-in-time snapshot of a user's live sessions (the user channel).
    #[must_use]
    pub fn user_snapshot(&self, user_id: u64) -> Vec<u64> {
        self.user_sessions.get(&user_id).map_or_else(Vec::new, |s| s.iter().copied().collect())
    }

    /// All rooms a session is subscribed to.
    pub fn rooms_for_session(&self, session_id: u64) -> impl Iterator<Item = u64> + '_ {
        self.session_rooms.get(&session_id).into_iter().flat_map(|r| r.iter().copied())
    }

    /// Total number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions subscribed to a room.
    #[must_use]
    pub fn room_session_count(&self, room_id: u64) -> usize {
        self.room_subscriptions.get(&room_id).map_or(0, HashSet::len)
    }
}
