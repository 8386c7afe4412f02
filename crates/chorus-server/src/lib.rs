//! Chorus production server.
//!
//! Production server implementation using Quinn for QUIC transport, Tokio
//! for async runtime, and system time with cryptographic RNG.
//!
//! # Architecture
//!
//! This crate provides production "glue" that wraps [`chorus_core`]'s
//! action-based logic with real I/O. The [`ServerDriver`] follows the
//! sans-io pattern: events in, actions out. The [`Server`] executes the
//! actions using Quinn QUIC and the Tokio runtime. `Broadcast` actions
//! carry their target snapshot, so every send happens after the driver
//! lock is released.
//!
//! # Components
//!
//! - [`ServerDriver`]: Action-based orchestrator (pure logic, no I/O)
//! - [`RoomBroadcaster`]: Authorization and ordering boundary for room
//!   traffic
//! - [`Notifier`]: User-channel notification persistence
//! - [`ConnectionRegistry`]: Session, room, and user-channel indexes
//! - [`Server`]: Production runtime that executes driver actions
//! - [`QuinnTransport`]: QUIC transport via Quinn
//! - [`SystemEnv`]: Production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broadcaster;
mod driver;
mod error;
mod notifier;
mod registry;
mod server_error;
pub mod stores;
mod system_env;
mod transport;

use std::{collections::HashMap, sync::Arc, time::Duration};

pub use broadcaster::{DeliveryError, MAX_BODY_BYTES, MAX_SYNC_BATCH, RoomBroadcaster};
use bytes::BytesMut;
use chorus_core::{auth::TokenVerifier, env::Environment};
use chorus_proto::{Frame, FrameHeader};
pub use driver::{ServerAction, ServerConfig as DriverConfig, ServerDriver, ServerEvent};
pub use error::ServerError;
pub use notifier::Notifier;
pub use registry::{ConnectionRegistry, SessionInfo};
pub use server_error::DriverError;
use stores::DataStore;
pub use system_env::SystemEnv;
use tokio::sync::RwLock;
pub use transport::{QuinnConnection, QuinnTransport};
use zerocopy::FromBytes;

/// Interval between driver ticks (timeout checks, heartbeats).
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Shared state for all connections.
///
/// This holds connection and stream maps for frame routing.
struct SharedState {
    /// Map of session ID to QUIC connection (for closing)
    connections: RwLock<HashMap<u64, QuinnConnection>>,
    /// Map of session ID to persistent outbound stream.
    /// All frames to a client go through this single stream, ensuring
    /// ordering.
    outbound_streams: RwLock<HashMap<u64, tokio::sync::Mutex<quinn::SendStream>>>,
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Driver configuration (timeouts, limits)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            driver: DriverConfig::default(),
        }
    }
}

/// Production Chorus server.
///
/// Wraps `ServerDriver` with Quinn QUIC transport and system environment.
/// Generic over the store so the binary can pick memory or redb backing.
pub struct Server<S>
where
    S: DataStore,
{
    /// The action-based server driver
    driver: ServerDriver<SystemEnv, S>,
    /// QUIC endpoint
    transport: QuinnTransport,
    /// Environment
    env: SystemEnv,
}

impl<S> Server<S>
where
    S: DataStore,
{
    /// Create and bind a new server.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` or `ServerError::Transport` when the
    /// endpoint cannot be created.
    pub fn bind(
        config: ServerRuntimeConfig,
        store: S,
        verifier: TokenVerifier,
    ) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let idle_timeout = config.driver.connection.idle_timeout;
        let driver = ServerDriver::new(env.clone(), store, verifier, config.driver);

        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path,
            config.key_path,
            idle_timeout,
        )?;

        Ok(Self { driver, transport, env })
    }

    /// Run the server, accepting connections and processing frames.
    ///
    /// This method runs until the server is shut down or an error occurs.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the accept loop fails fatally.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let env = self.env;
        let driver = Arc::new(tokio::sync::Mutex::new(self.driver));
        let shared = Arc::new(SharedState {
            connections: RwLock::new(HashMap::new()),
            outbound_streams: RwLock::new(HashMap::new()),
        });

        // Periodic tick: timeout detection and heartbeats
        {
            let driver = Arc::clone(&driver);
            let shared = Arc::clone(&shared);
            let env = env.clone();

            tokio::spawn(async move {
                loop {
                    env.sleep(TICK_INTERVAL).await;

                    let actions = {
                        let mut driver = driver.lock().await;
                        match driver.process_event(ServerEvent::Tick) {
                            Ok(actions) => actions,
                            Err(e) => {
                                tracing::error!("Tick processing error: {}", e);
                                continue;
                            },
                        }
                    };

                    execute_actions(actions, &shared).await;
                }
            });
        }

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let driver = Arc::clone(&driver);
                    let shared = Arc::clone(&shared);
                    let env = env.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, driver, shared, env).await {
                            tracing::error!("Connection error: {}", e);
                        }
                    });
                },
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                },
            }
        }
    }

    /// Local address the server is bound to.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Transport` if the socket address cannot be
    /// read.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}

/// Handle a single QUIC connection.
async fn handle_connection<S>(
    conn: QuinnConnection,
    driver: Arc<tokio::sync::Mutex<ServerDriver<SystemEnv, S>>>,
    shared: Arc<SharedState>,
    env: SystemEnv,
) -> Result<(), ServerError>
where
    S: DataStore,
{
    let session_id = env.random_u64();

    tracing::debug!("New connection: {} from {}", session_id, conn.remote_addr());

    let outbound_stream = conn
        .open_uni()
        .await
        .map_err(|e| ServerError::Internal(format!("Failed to open outbound stream: {e}")))?;

    {
        let mut connections = shared.connections.write().await;
        connections.insert(session_id, conn.clone());
    }

    {
        let mut streams = shared.outbound_streams.write().await;
        streams.insert(session_id, tokio::sync::Mutex::new(outbound_stream));
    }

    let actions = {
        let mut driver = driver.lock().await;
        driver.process_event(ServerEvent::ConnectionAccepted { session_id })?
    };
    execute_actions(actions, &shared).await;

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let driver = Arc::clone(&driver);
                let shared = Arc::clone(&shared);

                tokio::spawn(async move {
                    if let Err(e) = handle_stream(session_id, send, recv, driver, &shared).await {
                        tracing::debug!("Stream error: {}", e);
                    }
                });
            },
            Err(e) => {
                tracing::debug!("Connection closed: {}", e);
                break;
            },
        }
    }

    {
        let mut connections = shared.connections.write().await;
        connections.remove(&session_id);
    }

    {
        let mut streams = shared.outbound_streams.write().await;
        streams.remove(&session_id);
    }

    let actions = {
        let mut driver = driver.lock().await;
        driver.process_event(ServerEvent::ConnectionClosed {
            session_id,
            reason: "connection closed".to_string(),
        })?
    };
    execute_actions(actions, &shared).await;

    Ok(())
}

/// Handle a single bidirectional stream.
async fn handle_stream<S>(
    session_id: u64,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    driver: Arc<tokio::sync::Mutex<ServerDriver<SystemEnv, S>>>,
    shared: &Arc<SharedState>,
) -> Result<(), ServerError>
where
    S: DataStore,
{
    // Replies go down the persistent outbound stream, not this one
    drop(send);

    let mut buf = BytesMut::with_capacity(65536);

    loop {
        buf.clear();
        buf.resize(FrameHeader::SIZE, 0);

        match recv.read_exact(&mut buf[..FrameHeader::SIZE]).await {
            Ok(()) => {},
            Err(e) => {
                tracing::debug!("Read error: {}", e);
                break;
            },
        }

        let header: &FrameHeader = match FrameHeader::ref_from_bytes(&buf[..FrameHeader::SIZE]) {
            Ok(h) => h,
            Err(_) => {
                tracing::warn!("Invalid frame header");
                break;
            },
        };

        let payload_size = header.payload_size() as usize;

        if payload_size > 0 {
            buf.resize(FrameHeader::SIZE + payload_size, 0);
            if let Err(e) = recv.read_exact(&mut buf[FrameHeader::SIZE..]).await {
                tracing::debug!("Payload read error: {}", e);
                break;
            }
        }

        let frame = match Frame::decode(&buf) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Frame decode error: {}", e);
                break;
            },
        };

        // Actions are collected under the driver lock, sends execute after
        // it is released
        let actions = {
            let mut driver = driver.lock().await;
            match driver.process_event(ServerEvent::FrameReceived { session_id, frame }) {
                Ok(actions) => actions,
                Err(e) => {
                    tracing::warn!("Frame processing error: {}", e);
                    continue;
                },
            }
        };

        execute_actions(actions, shared).await;
    }

    Ok(())
}

/// Execute server actions.
///
/// Sends are best-effort per target: one failed write is logged and never
/// aborts the remaining targets.
async fn execute_actions(actions: Vec<ServerAction>, shared: &SharedState) {
    for action in actions {
        match action {
            ServerAction::SendToSession { session_id, frame } => {
                let mut buf = Vec::new();
                if let Err(e) = frame.encode(&mut buf) {
                    tracing::error!("Frame encode error: {}", e);
                    continue;
                }

                send_to_session(session_id, &buf, shared).await;
            },

            ServerAction::Broadcast { targets, frame } => {
                let mut buf = Vec::new();
                if let Err(e) = frame.encode(&mut buf) {
                    tracing::error!("Frame encode error: {}", e);
                    continue;
                }

                for session_id in targets {
                    send_to_session(session_id, &buf, shared).await;
                }
            },

            ServerAction::CloseConnection { session_id, reason } => {
                tracing::info!("Closing connection {}: {}", session_id, reason);
                let mut connections = shared.connections.write().await;
                if let Some(conn) = connections.remove(&session_id) {
                    conn.close(0u32.into(), reason.as_bytes());
                }
            },
        }
    }
}

/// Write one encoded frame to a session's outbound stream.
async fn send_to_session(session_id: u64, buf: &[u8], shared: &SharedState) {
    let streams = shared.outbound_streams.read().await;
    if let Some(stream_mutex) = streams.get(&session_id) {
        let mut stream = stream_mutex.lock().await;
        if let Err(e) = stream.write_all(buf).await {
            tracing::warn!("Write failed for session {}: {}", session_id, e);
        }
    } else {
        tracing::debug!("Send skipped: session {} has no outbound stream", session_id);
    }
}
