//! Store error taxonomy.

use thiserror::Error;

/// Errors surfaced by the collaborator stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Requested row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Row could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying database or filesystem failure
    #[error("io error: {0}")]
    Io(String),

    /// Store is temporarily unable to serve requests
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if retrying the same operation may succeed.
    ///
    /// I/O and availability failures are transient; a missing row or a
    /// corrupt encoding will not fix itself.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable(_))
    }
}
