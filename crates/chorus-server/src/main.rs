//! Chorus server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate and in-memory store (development)
//! chorus-server --bind 0.0.0.0:4433 --jwt-secret my-secret --allow-guest
//!
//! # Start with TLS certificate and durable storage (production)
//! chorus-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem \
//!     --jwt-secret my-secret --data-dir /var/lib/chorus
//! ```

use std::path::PathBuf;

use chorus_core::auth::TokenVerifier;
use chorus_server::{
    DriverConfig, Server, ServerRuntimeConfig,
    stores::{MemoryStore, RedbStore},
};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Chorus group-chat delivery server
#[derive(Parser, Debug)]
#[command(name = "chorus-server")]
#[command(about = "Chorus group-chat delivery server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shared secret for verifying bearer tokens
    #[arg(long)]
    jwt_secret: Option<String>,

    /// Accept the guest sentinel credential (development only)
    #[arg(long)]
    allow_guest: bool,

    /// Directory for durable storage; in-memory store when absent
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Chorus server starting");
    tracing::info!("Binding to {}", args.bind);

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("This is NOT suitable for production use!");
    }

    let secret = match args.jwt_secret {
        Some(secret) => secret,
        None => {
            tracing::warn!("No --jwt-secret provided - using insecure development secret");
            "chorus-dev-secret".to_string()
        },
    };

    if args.allow_guest {
        tracing::warn!("Guest access enabled - any client may connect as the guest identity");
    }

    let verifier = TokenVerifier::new(secret.as_bytes(), args.allow_guest);

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        driver: DriverConfig { max_connections: args.max_connections, ..Default::default() },
    };

    match args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let path = dir.join("chorus.redb");
            tracing::info!("Using durable store at {}", path.display());

            let store = RedbStore::open(&path)?;
            let server = Server::bind(config, store, verifier)?;

            tracing::info!("Server listening on {}", server.local_addr()?);
            server.run().await?;
        },
        None => {
            tracing::warn!("No --data-dir provided - messages will not survive restart");

            let store = MemoryStore::new();
            let server = Server::bind(config, store, verifier)?;

            tracing::info!("Server listening on {}", server.local_addr()?);
            server.run().await?;
        },
    }

    Ok(())
}
