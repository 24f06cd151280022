//! Persistence of room documents.
//!
//! A room's full [`DocumentState`] is stored as one binary snapshot. The
//! room actor saves it on flush ticks and before eviction, and loads it when
//! the room is first joined.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::DocumentState;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corruption detected in snapshot: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata stored alongside room snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub room_id: String,
    /// Names of the replicas in the snapshot
    pub replicas: Vec<String>,
    /// Unix timestamp of the last save
    pub saved_at: i64,
    /// Encoded snapshot size in bytes
    pub size_bytes: u64,
}

impl SnapshotMetadata {
    pub fn for_state(room_id: &str, state: &DocumentState, size_bytes: u64) -> Self {
        Self {
            room_id: room_id.to_string(),
            replicas: state.replica_names(),
            saved_at: chrono::Utc::now().timestamp(),
            size_bytes,
        }
    }
}

/// Where room snapshots go
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    async fn save(&self, room_id: &str, state: &DocumentState) -> StorageResult<()>;

    async fn load(&self, room_id: &str) -> StorageResult<Option<DocumentState>>;

    /// Returns whether a snapshot existed
    async fn delete(&self, room_id: &str) -> StorageResult<bool>;

    async fn list(&self) -> StorageResult<Vec<SnapshotMetadata>>;
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Sled background flush interval in milliseconds (0 = only explicit flushes)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/rooms.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}
