//! Crate-level error type returned by the client API.

use crate::crdt::CrdtError;
use crate::room::RoomError;
use crate::storage::StorageError;
use crate::sync::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    /// Bad input; nothing was emitted
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Structurally impossible request (cycle, missing node, wrong replica kind)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("Room error: {0}")]
    Room(#[from] RoomError),

    #[error("Not connected")]
    NotConnected,
}

impl From<CrdtError> for CollabError {
    fn from(err: CrdtError) -> Self {
        match err {
            CrdtError::Validation(msg) => CollabError::Validation(msg),
            other => CollabError::InvalidOperation(other.to_string()),
        }
    }
}

/// Result type for client operations
pub type CollabResult<T> = Result<T, CollabError>;
