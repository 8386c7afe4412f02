//! Chorus protocol core.
//!
//! Pure logic shared between server and clients: the connection lifecycle
//! state machine, credential verification, and the [`Environment`]
//! abstraction that keeps time and randomness injectable for deterministic
//! tests. No I/O happens in this crate.

pub mod auth;
pub mod connection;
pub mod env;
pub mod error;

pub use auth::{AuthClaims, AuthError, TokenVerifier};
pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState};
pub use env::Environment;
pub use error::ConnectionError;
