//! Server driver.
//!
//! Ties together connection state machines, credential verification, the
//! ConnectionRegistry (session, room, and user-channel indexes), the
//! RoomBroadcaster, and the Notifier.
//!
//! The driver is sans-io: events go in, actions come out. The runtime owns
//! the driver behind one lock; every registry read and mutation for an
//! event happens inside that boundary, and the returned `Broadcast` actions
//! carry point-in-time target snapshots so the actual sends run after the
//! lock is released. A session that subscribes mid-broadcast joins from the
//! next message.

use std::collections::HashMap;

use chorus_core::{
    auth::TokenVerifier,
    connection::{Connection, ConnectionAction, ConnectionConfig},
    env::Environment,
};
use chorus_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::{ErrorPayload, notify::NotificationKind, session::HelloReply},
};

use crate::{
    broadcaster::{DeliveryError, RoomBroadcaster},
    notifier::Notifier,
    registry::ConnectionRegistry,
    server_error::DriverError,
    stores::{DataStore, StoreError},
};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connection configuration (timeouts, heartbeat interval)
    pub connection: ConnectionConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { connection: ConnectionConfig::default(), max_connections: 10_000 }
    }
}

/// Events that the server driver processes.
///
/// Produced by the external runtime (tests or production).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime
        session_id: u64,
    },

    /// A frame was received from a connection
    FrameReceived {
        /// Connection that sent the frame
        session_id: u64,
        /// The received frame
        frame: Frame,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Connection that was closed
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for timeout checking and heartbeats
    Tick,
}

/// Actions that the server driver produces.
///
/// Executed by runtime-specific code after releasing the driver lock.
#[derive(Debug, Clone)]
pub enum ServerAction {
    /// Send a frame to a specific session
    SendToSession {
        /// Target session ID
        session_id: u64,
        /// Frame to send
        frame: Frame,
    },

    /// Send one frame to a snapshot of sessions, best-effort per target.
    ///
    /// A failed send to one target never aborts the rest.
    Broadcast {
        /// Point-in-time target snapshot
        targets: Vec<u64>,
        /// Frame to send to every target
        frame: Frame,
    },

    /// Close a connection
    CloseConnection {
        /// Session to close
        session_id: u64,
        /// Reason for closure
        reason: String,
    },
}

/// Action-based server driver.
///
/// Orchestrates connection lifecycle, authorization, message delivery, and
/// notification fan-out. Pure logic, no I/O.
pub struct ServerDriver<E, S>
where
    E: Environment,
    S: DataStore,
{
    /// Connection state machines (session_id → Connection)
    connections: HashMap<u64, Connection<E::Instant>>,
    /// Session/room/user-channel registry
    pub(crate) registry: ConnectionRegistry,
    /// Message posting and resync
    broadcaster: RoomBroadcaster<S>,
    /// Notification persistence
    notifier: Notifier<S>,
    /// Credential verification
    verifier: TokenVerifier,
    /// Environment (time, RNG)
    env: E,
    /// Server configuration
    config: ServerConfig,
}

impl<E, S> ServerDriver<E, S>
where
    E: Environment,
    S: DataStore,
{
    /// Create a new server driver.
    pub fn new(env: E, store: S, verifier: TokenVerifier, config: ServerConfig) -> Self {
        Self {
            connections: HashMap::new(),
            registry: ConnectionRegistry::new(),
            broadcaster: RoomBroadcaster::new(store.clone()),
            notifier: Notifier::new(store),
            verifier,
            env,
            config,
        }
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    ///
    /// # Errors
    ///
    /// Returns `DriverError` for states the driver cannot answer over the
    /// wire (unknown session, connection machine failure). Authorization
    /// and store failures become Error frames in the returned actions.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, DriverError> {
        match event {
            ServerEvent::ConnectionAccepted { session_id } => {
                Ok(self.handle_connection_accepted(session_id))
            },
            ServerEvent::FrameReceived { session_id, frame } => {
                self.handle_frame_received(session_id, &frame)
            },
            ServerEvent::ConnectionClosed { session_id, reason } => {
                Ok(self.handle_connection_closed(session_id, &reason))
            },
            ServerEvent::Tick => Ok(self.handle_tick()),
        }
    }

    /// Persist a notification and push it to the recipient's user channel.
    ///
    /// Server-initiated: called by operator tooling or membership flows,
    /// not by a client frame. Persistence happens first; if the recipient
    /// has no live sessions the returned actions are empty and the row
    /// waits in the store.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Store` if the row could not be persisted. No
    /// fan-out happens in that case.
    pub fn notify(
        &mut self,
        recipient_id: u64,
        kind: NotificationKind,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let created_at_ms = self.env.wall_clock_ms();
        let notification = self.notifier.notify(recipient_id, kind, created_at_ms)?;

        let targets = self.registry.user_snapshot(recipient_id);
        if targets.is_empty() {
            tracing::debug!(recipient_id, "notification persisted, recipient offline");
            return Ok(Vec::new());
        }

        let mut header = FrameHeader::new(Opcode::Notification);
        header.set_recipient_id(recipient_id);
        header.set_timestamp_ms(created_at_ms);

        let frame = Payload::Notification(notification).into_frame(header)?;

        tracing::debug!(recipient_id, sessions = targets.len(), "notification fan-out");
        Ok(vec![ServerAction::Broadcast { targets, frame }])
    }

    /// Handle a new connection being accepted.
    fn handle_connection_accepted(&mut self, session_id: u64) -> Vec<ServerAction> {
        if self.connections.len() >= self.config.max_connections {
            tracing::warn!(session_id, "rejecting connection: max connections exceeded");
            return vec![ServerAction::CloseConnection {
                session_id,
                reason: "max connections exceeded".to_string(),
            }];
        }

        let now = self.env.now();
        self.connections.insert(session_id, Connection::new(now, self.config.connection.clone()));
        self.registry.register(session_id);

        tracing::debug!(session_id, "connection accepted");
        Vec::new()
    }

    /// Handle a frame received from a connection.
    fn handle_frame_received(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if !self.connections.contains_key(&session_id) {
            return Err(DriverError::SessionNotFound(session_id));
        }

        let Some(opcode) = frame.header.opcode_enum() else {
            return self.protocol_violation(
                session_id,
                frame,
                &format!("unknown opcode 0x{:04x}", frame.header.opcode()),
            );
        };

        match opcode {
            Opcode::Hello => self.handle_hello(session_id, frame),

            Opcode::Ping | Opcode::Pong | Opcode::Goodbye | Opcode::Error => {
                self.handle_session_frame(session_id, frame)
            },

            Opcode::Subscribe => self.handle_subscribe(session_id, frame),
            Opcode::Unsubscribe => self.handle_unsubscribe(session_id, frame),
            Opcode::PostMessage => self.handle_post_message(session_id, frame),
            Opcode::SyncRequest => self.handle_sync_request(session_id, frame),

            // Server-to-client opcodes arriving inbound
            Opcode::HelloReply
            | Opcode::SubscribeAck
            | Opcode::UnsubscribeAck
            | Opcode::MessageAck
            | Opcode::MessageEvent
            | Opcode::SyncResponse
            | Opcode::Notification => self.protocol_violation(
                session_id,
                frame,
                &format!("client sent server-only opcode {opcode:?}"),
            ),
        }
    }

    /// Route a session-layer frame through the connection state machine.
    fn handle_session_frame(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let now = self.env.now();
        let conn = self
            .connections
            .get_mut(&session_id)
            .ok_or(DriverError::SessionNotFound(session_id))?;

        let conn_actions = conn
            .handle_frame(frame, now)
            .map_err(|e| DriverError::Connection { session_id, reason: e.to_string() })?;

        Ok(conn_actions
            .into_iter()
            .map(|action| match action {
                ConnectionAction::SendFrame(f) => {
                    ServerAction::SendToSession { session_id, frame: f }
                },
                ConnectionAction::Close { reason } => {
                    ServerAction::CloseConnection { session_id, reason }
                },
            })
            .collect())
    }

    /// Handle the Hello handshake: verify the credential and bind identity.
    fn handle_hello(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let now = self.env.now();

        let hello = match Payload::from_frame(frame) {
            Ok(Payload::Hello(hello)) => hello,
            Ok(_) | Err(_) => {
                return self.protocol_violation(session_id, frame, "malformed Hello payload");
            },
        };

        if hello.version != FrameHeader::VERSION {
            return self.reject_session(
                session_id,
                frame,
                ErrorPayload::protocol(format!("unsupported protocol version {}", hello.version)),
            );
        }

        match self.verifier.verify(&hello.credential) {
            Ok(claims) => {
                let conn = self
                    .connections
                    .get_mut(&session_id)
                    .ok_or(DriverError::SessionNotFound(session_id))?;

                conn.authenticate(claims.user_id, claims.guest, now)
                    .map_err(|e| DriverError::Connection { session_id, reason: e.to_string() })?;
                self.registry.bind_user(session_id, claims.user_id, claims.guest);

                tracing::info!(
                    session_id,
                    user_id = claims.user_id,
                    guest = claims.guest,
                    "session authenticated"
                );

                let reply = Payload::HelloReply(HelloReply {
                    session_id,
                    user_id: claims.user_id,
                    guest: claims.guest,
                });

                let mut header = FrameHeader::new(Opcode::HelloReply);
                header.set_request_id(frame.header.request_id());

                Ok(vec![ServerAction::SendToSession {
                    session_id,
                    frame: reply.into_frame(header)?,
                }])
            },
            Err(e) => {
                tracing::warn!(session_id, error = %e, "credential verification failed");
                self.reject_session(session_id, frame, ErrorPayload::auth_failed(e.to_string()))
            },
        }
    }

    /// Handle a room subscribe request.
    fn handle_subscribe(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let Some(user_id) = self.authenticated_user(session_id)? else {
            return self.send_error(session_id, frame, ErrorPayload::unauthenticated());
        };

        let room_id = frame.header.room_id();

        // Membership is checked fresh, never cached
        match self.broadcaster.subscribe_check(room_id, user_id) {
            Ok(latest_message_id) => {
                self.registry.subscribe(session_id, room_id);
                self.touch(session_id);

                tracing::debug!(session_id, user_id, room_id, "subscribed");

                let reply = Payload::SubscribeAck(chorus_proto::payloads::room::SubscribeAck {
                    latest_message_id,
                });

                let mut header = FrameHeader::new(Opcode::SubscribeAck);
                header.set_room_id(room_id);
                header.set_request_id(frame.header.request_id());

                Ok(vec![ServerAction::SendToSession {
                    session_id,
                    frame: reply.into_frame(header)?,
                }])
            },
            Err(DeliveryError::NotMember { .. }) => {
                tracing::warn!(session_id, user_id, room_id, "subscribe rejected: not a member");
                self.send_error(session_id, frame, ErrorPayload::forbidden(room_id))
            },
            Err(e @ (DeliveryError::EmptyBody | DeliveryError::BodyTooLarge { .. })) => {
                self.send_error(session_id, frame, ErrorPayload::invalid_argument(e.to_string()))
            },
            Err(DeliveryError::Store(e)) => {
                self.send_error(session_id, frame, store_error_payload(&e))
            },
        }
    }

    /// Handle a room unsubscribe request. Always acked, even when the
    /// session was not subscribed.
    fn handle_unsubscribe(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if self.authenticated_user(session_id)?.is_none() {
            return self.send_error(session_id, frame, ErrorPayload::unauthenticated());
        }

        let room_id = frame.header.room_id();
        self.registry.unsubscribe(session_id, room_id);
        self.touch(session_id);

        let mut header = FrameHeader::new(Opcode::UnsubscribeAck);
        header.set_room_id(room_id);
        header.set_request_id(frame.header.request_id());

        Ok(vec![ServerAction::SendToSession {
            session_id,
            frame: Payload::UnsubscribeAck.into_frame(header)?,
        }])
    }

    /// Handle a message post: validate, persist, ack, fan out.
    fn handle_post_message(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let Some(user_id) = self.authenticated_user(session_id)? else {
            return self.send_error(session_id, frame, ErrorPayload::unauthenticated());
        };

        let post = match Payload::from_frame(frame) {
            Ok(Payload::PostMessage(post)) => post,
            Ok(_) | Err(_) => {
                return self.protocol_violation(session_id, frame, "malformed PostMessage payload");
            },
        };

        let room_id = frame.header.room_id();
        let created_at_ms = self.env.wall_clock_ms();

        match self.broadcaster.post_message(room_id, user_id, &post.body, created_at_ms) {
            Ok(message) => {
                self.touch(session_id);

                // Persisted; snapshot the room now, sends happen outside
                // the driver lock
                let targets: Vec<u64> = self
                    .registry
                    .room_snapshot(room_id)
                    .into_iter()
                    .filter(|&s| s != session_id)
                    .collect();

                tracing::debug!(
                    session_id,
                    user_id,
                    room_id,
                    message_id = message.message_id,
                    recipients = targets.len(),
                    "message posted"
                );

                let mut ack_header = FrameHeader::new(Opcode::MessageAck);
                ack_header.set_room_id(room_id);
                ack_header.set_sender_id(user_id);
                ack_header.set_message_id(message.message_id);
                ack_header.set_timestamp_ms(created_at_ms);
                ack_header.set_request_id(frame.header.request_id());

                let ack = Payload::MessageAck(message.clone()).into_frame(ack_header)?;

                let mut actions = vec![ServerAction::SendToSession { session_id, frame: ack }];

                if !targets.is_empty() {
                    let mut event_header = FrameHeader::new(Opcode::MessageEvent);
                    event_header.set_room_id(room_id);
                    event_header.set_sender_id(user_id);
                    event_header.set_message_id(message.message_id);
                    event_header.set_timestamp_ms(created_at_ms);

                    let event = Payload::MessageEvent(message).into_frame(event_header)?;
                    actions.push(ServerAction::Broadcast { targets, frame: event });
                }

                Ok(actions)
            },
            Err(DeliveryError::NotMember { .. }) => {
                tracing::warn!(session_id, user_id, room_id, "post rejected: not a member");
                self.send_error(session_id, frame, ErrorPayload::forbidden(room_id))
            },
            Err(e @ (DeliveryError::EmptyBody | DeliveryError::BodyTooLarge { .. })) => {
                self.send_error(session_id, frame, ErrorPayload::invalid_argument(e.to_string()))
            },
            Err(DeliveryError::Store(e)) => {
                tracing::error!(session_id, room_id, error = %e, "post failed: store error");
                self.send_error(session_id, frame, store_error_payload(&e))
            },
        }
    }

    /// Handle a resync pull request.
    fn handle_sync_request(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let Some(user_id) = self.authenticated_user(session_id)? else {
            return self.send_error(session_id, frame, ErrorPayload::unauthenticated());
        };

        let request = match Payload::from_frame(frame) {
            Ok(Payload::SyncRequest(request)) => request,
            Ok(_) | Err(_) => {
                return self.protocol_violation(session_id, frame, "malformed SyncRequest payload");
            },
        };

        let room_id = frame.header.room_id();

        match self.broadcaster.handle_sync_request(
            room_id,
            user_id,
            request.from_message_id,
            request.limit,
        ) {
            Ok(response) => {
                self.touch(session_id);

                let mut header = FrameHeader::new(Opcode::SyncResponse);
                header.set_room_id(room_id);
                header.set_request_id(frame.header.request_id());

                Ok(vec![ServerAction::SendToSession {
                    session_id,
                    frame: Payload::SyncResponse(response).into_frame(header)?,
                }])
            },
            Err(DeliveryError::NotMember { .. }) => {
                self.send_error(session_id, frame, ErrorPayload::forbidden(room_id))
            },
            Err(e @ (DeliveryError::EmptyBody | DeliveryError::BodyTooLarge { .. })) => {
                self.send_error(session_id, frame, ErrorPayload::invalid_argument(e.to_string()))
            },
            Err(DeliveryError::Store(e)) => {
                self.send_error(session_id, frame, store_error_payload(&e))
            },
        }
    }

    /// Handle a connection being closed.
    fn handle_connection_closed(&mut self, session_id: u64, reason: &str) -> Vec<ServerAction> {
        if let Some(mut conn) = self.connections.remove(&session_id) {
            conn.close();
        }

        // Idempotent: a second close for the same session is a no-op
        if let Some((info, rooms)) = self.registry.deregister(session_id) {
            tracing::info!(
                session_id,
                user_id = info.user_id,
                rooms = rooms.len(),
                reason,
                "connection closed"
            );
        }

        Vec::new()
    }

    /// Handle periodic tick for timeout checking and heartbeats.
    fn handle_tick(&mut self) -> Vec<ServerAction> {
        let now = self.env.now();
        let mut actions = Vec::new();

        for (&session_id, conn) in &mut self.connections {
            for action in conn.tick(now) {
                match action {
                    ConnectionAction::SendFrame(f) => {
                        actions.push(ServerAction::SendToSession { session_id, frame: f });
                    },
                    ConnectionAction::Close { reason } => {
                        actions.push(ServerAction::CloseConnection { session_id, reason });
                    },
                }
            }
        }

        actions
    }

    /// Authenticated user for a session, or `None` when the operation must
    /// be answered with `Unauthenticated`.
    fn authenticated_user(&self, session_id: u64) -> Result<Option<u64>, DriverError> {
        let conn =
            self.connections.get(&session_id).ok_or(DriverError::SessionNotFound(session_id))?;
        Ok(conn.user_id())
    }

    /// Record inbound activity on a session's state machine.
    fn touch(&mut self, session_id: u64) {
        let now = self.env.now();
        if let Some(conn) = self.connections.get_mut(&session_id) {
            conn.update_activity(now);
        }
    }

    /// Answer with an Error frame, leaving the connection open.
    fn send_error(
        &self,
        session_id: u64,
        request: &Frame,
        payload: ErrorPayload,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let mut header = FrameHeader::new(Opcode::Error);
        header.set_room_id(request.header.room_id());
        header.set_request_id(request.header.request_id());

        Ok(vec![ServerAction::SendToSession {
            session_id,
            frame: Payload::Error(payload).into_frame(header)?,
        }])
    }

    /// Answer with an Error frame and close the connection.
    fn protocol_violation(
        &mut self,
        session_id: u64,
        request: &Frame,
        reason: &str,
    ) -> Result<Vec<ServerAction>, DriverError> {
        tracing::warn!(session_id, reason, "protocol violation");

        let mut actions = self.send_error(session_id, request, ErrorPayload::protocol(reason))?;
        actions.push(ServerAction::CloseConnection {
            session_id,
            reason: format!("protocol violation: {reason}"),
        });
        Ok(actions)
    }

    /// Reject a connecting session: error frame, terminal Rejected state,
    /// close.
    fn reject_session(
        &mut self,
        session_id: u64,
        request: &Frame,
        payload: ErrorPayload,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if let Some(conn) = self.connections.get_mut(&session_id) {
            // Ignore failures: a non-Connecting machine is already past
            // rejection
            let _ = conn.reject();
        }

        let reason = payload.message.clone();
        let mut actions = self.send_error(session_id, request, payload)?;
        actions.push(ServerAction::CloseConnection { session_id, reason });
        Ok(actions)
    }

    /// Number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Check whether a session is subscribed to a room.
    #[must_use]
    pub fn is_subscribed(&self, session_id: u64, room_id: u64) -> bool {
        self.registry.is_subscribed(session_id, room_id)
    }

    /// Authenticated user bound to a session, if any.
    #[must_use]
    pub fn session_user(&self, session_id: u64) -> Option<u64> {
        self.registry.session(session_id).and_then(|info| info.user_id)
    }
}

impl<E, S> std::fmt::Debug for ServerDriver<E, S>
where
    E: Environment,
    S: DataStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("connection_count", &self.connections.len())
            .field("session_count", &self.registry.session_count())
            .finish_non_exhaustive()
    }
}

/// Map a store failure to its wire representation.
///
/// Transient failures are advertised as retryable; everything else is a
/// non-retryable protocol-level failure.
fn store_error_payload(error: &StoreError) -> ErrorPayload {
    if error.is_transient() {
        ErrorPayload::store_unavailable(error.to_string())
    } else {
        ErrorPayload::protocol(error.to_string())
    }
}
