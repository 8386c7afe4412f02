//! Session layer state machine.
//!
//! Manages connection lifecycle, heartbeats, timeouts, and graceful
//! shutdown. Uses the action pattern: methods take time as input and return
//! actions for the driver to execute. This keeps the state machine pure (no
//! I/O) and makes testing straightforward.
//!
//! Credential verification needs the server's verifier, so the driver
//! inspects the Hello frame itself and then calls
//! [`Connection::authenticate`] or [`Connection::reject`] on the machine.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐ authenticate ┌───────────────┐
//! │ Connecting │─────────────>│ Authenticated │
//! └────────────┘              └───────────────┘
//!    │       │                        │
//!    │reject │ timeout                │ Goodbye/timeout
//!    ↓       ↓                        ↓
//! ┌──────────┐ ┌────────┐        ┌────────┐
//! │ Rejected │ │ Closed │        │ Closed │
//! └──────────┘ └────────┘        └────────┘
//! ```

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

use chorus_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::session::Goodbye,
};

use crate::error::ConnectionError;

/// Time allowed to complete the Hello/HelloReply handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time allowed without any activity before the connection is
/// closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which the connection sends Ping frames while authenticated.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Actions returned by the connection state machine.
///
/// The driver (test harness or production server) executes these actions:
/// - `SendFrame`: Serialize and send the frame over the transport
/// - `Close`: Close the connection with the given reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send this frame to the peer
    SendFrame(Frame),

    /// Close the connection with this reason
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, waiting for Hello and credential verification
    Connecting,
    /// Credential verified, user identity bound
    Authenticated,
    /// Credential verification failed (terminal)
    Rejected,
    /// Connection closed (graceful or error)
    Closed,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for completing handshake
    pub handshake_timeout: Duration,
    /// Idle timeout before disconnecting
    pub idle_timeout: Duration,
    /// Heartbeat interval (should be < idle_timeout / 2)
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Connection state machine
///
/// Manages lifecycle, timeouts, and heartbeats for a single connection.
///
/// This is a pure state machine - no I/O, no Environment storage. Time is
/// passed as parameters to methods that need it.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug, Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Current state
    state: ConnectionState,
    /// Configuration
    config: ConnectionConfig,
    /// Last activity timestamp
    last_activity: I,
    /// Last heartbeat sent timestamp
    last_heartbeat: Option<I>,
    /// Authenticated user identity, `None` until authenticated
    user_id: Option<u64>,
    /// True when authenticated via the guest sentinel
    guest: bool,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new connection in [`ConnectionState::Connecting`] state
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Connecting,
            config,
            last_activity: now,
            last_heartbeat: None,
            user_id: None,
            guest: false,
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Authenticated user identity. `None` until authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<u64> {
        self.user_id
    }

    /// True when the connection authenticated via the guest sentinel.
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.guest
    }

    /// Bind a verified user identity (server use, after credential check).
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if not in Connecting state
    pub fn authenticate(
        &mut self,
        user_id: u64,
        guest: bool,
        now: I,
    ) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "authenticate".to_string(),
            });
        }

        self.state = ConnectionState::Authenticated;
        self.user_id = Some(user_id);
        self.guest = guest;
        self.last_activity = now;

        Ok(())
    }

    /// Mark the connection rejected after failed credential verification.
    ///
    /// Terminal: a rejected connection never authenticates and never
    /// transitions again.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if not in Connecting state
    pub fn reject(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "reject".to_string(),
            });
        }

        self.state = ConnectionState::Rejected;
        Ok(())
    }

    /// Mark connection as closed.
    ///
    /// `Rejected` is terminal and stays `Rejected`.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Rejected {
            self.state = ConnectionState::Closed;
        }
    }

    /// Mark connection as active (call when receiving frames).
    pub fn update_activity(&mut self, now: I) {
        self.last_activity = now;
    }

    /// Elapsed time since last activity, if timeout exceeded. `None`
    /// otherwise.
    #[must_use]
    pub fn check_timeout(&self, now: I) -> Option<Duration> {
        let elapsed = now - self.last_activity;

        let timeout = match self.state {
            ConnectionState::Connecting => self.config.handshake_timeout,
            ConnectionState::Authenticated => self.config.idle_timeout,
            ConnectionState::Rejected | ConnectionState::Closed => return None,
        };

        if elapsed > timeout { Some(elapsed) } else { None }
    }

    /// Process periodic maintenance (timeouts and heartbeats).
    ///
    /// Call this periodically to trigger timeout detection and heartbeat
    /// sending.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        if let Some(elapsed) = self.check_timeout(now) {
            let reason = match self.state {
                ConnectionState::Connecting => format!("handshake timeout after {elapsed:?}"),
                ConnectionState::Authenticated => format!("idle timeout after {elapsed:?}"),
                ConnectionState::Rejected | ConnectionState::Closed => "timeout".to_string(),
            };

            self.close();
            actions.push(ConnectionAction::Close { reason });
            return actions;
        }

        if self.state == ConnectionState::Authenticated {
            let should_send = match self.last_heartbeat {
                None => true, // Never sent heartbeat
                Some(last) => {
                    let elapsed = now - last;
                    elapsed >= self.config.heartbeat_interval
                },
            };

            if should_send {
                let ping_frame = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());

                actions.push(ConnectionAction::SendFrame(ping_frame));
                self.last_heartbeat = Some(now);
            }
        }

        actions
    }

    /// Process an incoming session-layer frame and update state.
    ///
    /// Handles Ping, Pong, Goodbye, and Error. Hello is NOT handled here:
    /// credential verification needs the server's verifier, so the driver
    /// handles Hello and calls [`Self::authenticate`]/[`Self::reject`].
    ///
    /// # Errors
    ///
    /// - `ConnectionError::UnexpectedFrame` if opcode invalid for current
    ///   state
    /// - `ConnectionError::InvalidPayload` if CBOR deserialization fails
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.last_activity = now;

        let Some(opcode) = frame.header.opcode_enum() else {
            return Err(ConnectionError::UnexpectedFrame {
                state: self.state,
                opcode: frame.header.opcode(),
            });
        };

        match (self.state, opcode) {
            (ConnectionState::Authenticated, Opcode::Ping) => {
                let pong_frame = Frame::new(FrameHeader::new(Opcode::Pong), Vec::new());
                Ok(vec![ConnectionAction::SendFrame(pong_frame)])
            },

            (ConnectionState::Authenticated, Opcode::Pong) => {
                // Activity already updated
                Ok(vec![])
            },

            (ConnectionState::Connecting | ConnectionState::Authenticated, Opcode::Goodbye) => {
                let payload = Payload::from_frame(frame)?;

                let reason = match payload {
                    Payload::Goodbye(goodbye) => goodbye.reason,
                    _ => {
                        return Err(ConnectionError::InvalidPayload {
                            expected: "Goodbye",
                            opcode: Opcode::Goodbye.to_u16(),
                        });
                    },
                };

                self.close();

                let reply = Payload::Goodbye(Goodbye { reason: "ack".to_string() });
                let frame = reply.into_frame(FrameHeader::new(Opcode::Goodbye))?;

                Ok(vec![ConnectionAction::SendFrame(frame), ConnectionAction::Close {
                    reason: format!("peer goodbye: {reason}"),
                }])
            },

            (_, Opcode::Error) => {
                self.close();

                Ok(vec![ConnectionAction::Close { reason: "peer error".to_string() }])
            },

            (state, opcode) => {
                Err(ConnectionError::UnexpectedFrame { state, opcode: opcode.to_u16() })
            },
        }
    }
}
