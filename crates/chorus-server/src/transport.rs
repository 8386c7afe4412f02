//! Quinn-based QUIC transport implementation.
//!
//! Encrypted, multiplexed streams over UDP with TLS 1.3, shaped for the
//! chorus stream layout: clients send request frames on short-lived
//! bidirectional streams, the server pushes every outbound frame down one
//! persistent unidirectional stream per session. The transport enforces
//! that layout at the QUIC level (clients cannot open unidirectional
//! streams at all) and derives its idle timeout from the connection state
//! machine so the driver's Goodbye/timeout handling fires before QUIC
//! tears the connection down underneath it.
//!
//! # Security
//!
//! TLS 1.3 via `rustls`, ALPN pinned to "chorus". Self-signed certificates
//! are only suitable for local testing - production deployments MUST use
//! proper TLS certificates from a trusted CA.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chorus_proto::ALPN_PROTOCOL;
use quinn::{Endpoint, IdleTimeout, RecvStream, SendStream, ServerConfig, TransportConfig};

use crate::error::ServerError;

/// Slack added on top of the application idle timeout so the driver's
/// tick-driven close observably wins over a QUIC-level teardown.
const IDLE_TIMEOUT_SLACK: Duration = Duration::from_secs(15);

/// Request streams a client may hold open at once. Each request frame
/// rides its own bidirectional stream, so this bounds in-flight requests
/// per session, not throughput.
const MAX_CLIENT_REQUEST_STREAMS: u32 = 64;

/// QUIC transport using Quinn.
///
/// Provides a QUIC endpoint that can accept incoming connections,
/// configured with TLS 1.3, ALPN "chorus", and the stream limits above.
pub struct QuinnTransport {
    /// Quinn endpoint
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Create and bind a new QUIC transport.
    ///
    /// If `cert_path` and `key_path` are provided, they will be used for
    /// TLS. Otherwise, a self-signed certificate will be generated for
    /// testing. `idle_timeout` should be the connection state machine's
    /// idle timeout; the QUIC-level timeout is set slightly above it.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` for bad addresses or TLS material and
    /// `ServerError::Transport` if the endpoint cannot be created.
    pub fn bind(
        address: &str,
        cert_path: Option<String>,
        key_path: Option<String>,
        idle_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let mut server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(&cert, &key)?,
            _ => generate_self_signed_config()?,
        };
        server_config.transport_config(Arc::new(transport_config(idle_timeout)?));

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| ServerError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!("QUIC transport bound to {}", addr);

        Ok(Self { endpoint })
    }

    /// Accept a new QUIC connection.
    ///
    /// This method blocks until a connection is available.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Transport` if the endpoint is closed or the
    /// handshake fails.
    pub async fn accept(&self) -> Result<QuinnConnection, ServerError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| ServerError::Transport("endpoint closed".to_string()))?;

        let conn = incoming
            .await
            .map_err(|e| ServerError::Transport(format!("connection failed: {e}")))?;

        Ok(QuinnConnection { connection: conn })
    }

    /// Local address the transport is bound to.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Transport` if the socket address cannot be
    /// read.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// A QUIC connection wrapper.
///
/// Wraps Quinn's connection type with the operations the session loop
/// needs: accepting request streams, opening the one push stream, and
/// closing.
///
/// # Cloning
///
/// Clones are cheap and share the same underlying QUIC connection and can
/// be used concurrently.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Accept a bidirectional request stream from the client.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Transport` when the connection is closed.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| ServerError::Transport(format!("accept_bi failed: {e}")))
    }

    /// Open the session's persistent push stream.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Transport` when the connection is closed.
    pub async fn open_uni(&self) -> Result<SendStream, ServerError> {
        self.connection
            .open_uni()
            .await
            .map_err(|e| ServerError::Transport(format!("open_uni failed: {e}")))
    }

    /// Remote peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection with an error code and reason.
    pub fn close(&self, error_code: quinn::VarInt, reason: &[u8]) {
        self.connection.close(error_code, reason);
    }
}

/// Build the QUIC transport parameters for the chorus stream layout.
///
/// Clients get zero unidirectional stream credits: the push stream is
/// server-initiated, so a client-opened uni stream can only be a protocol
/// violation and QUIC refuses it before any payload arrives.
fn transport_config(idle_timeout: Duration) -> Result<TransportConfig, ServerError> {
    let quic_idle = IdleTimeout::try_from(idle_timeout.saturating_add(IDLE_TIMEOUT_SLACK))
        .map_err(|e| ServerError::Config(format!("idle timeout out of range: {e}")))?;

    let mut config = TransportConfig::default();
    config.max_idle_timeout(Some(quic_idle));
    config.max_concurrent_bidi_streams(MAX_CLIENT_REQUEST_STREAMS.into());
    config.max_concurrent_uni_streams(0u32.into());

    Ok(config)
}

/// Load TLS configuration from certificate and key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, ServerError> {
    use std::fs;

    let cert_pem = fs::read(cert_path)
        .map_err(|e| ServerError::Config(format!("failed to read cert '{cert_path}': {e}")))?;

    let key_pem = fs::read(key_path)
        .map_err(|e| ServerError::Config(format!("failed to read key '{key_path}': {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    server_config_with_certs(certs, key)
}

/// Generate a self-signed certificate for testing.
fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let cert_der = cert.cert.der().clone();
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    tracing::warn!("Using self-signed certificate - not for production use!");

    server_config_with_certs(vec![cert_der], key.into())
}

/// Finish a rustls config (ALPN pin) and wrap it for Quinn.
fn server_config_with_certs(
    certs: Vec<rustls::pki_types::CertificateDer<'static>>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
) -> Result<ServerConfig, ServerError> {
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?,
    ));

    Ok(server_config)
}
