//! Server-side rooms.
//!
//! This module handles:
//! - One actor task per room owning its document, awareness and sessions
//! - The registry that creates, restores and evicts rooms
//! - File tree operations over a room's tree replica

pub(crate) mod actor;
pub mod file_tree;
pub mod registry;

pub use file_tree::{FileTreeManager, NestedNode, FILE_TREE_REPLICA};
pub use registry::{BackgroundTaskHandles, RoomHandle, RoomRegistry};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::storage::StorageError;
use crate::sync::{RoomId, SyncConfig};

/// Configuration for the room registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a room with no sessions stays in memory
    pub idle_grace: Duration,
    /// Snapshot and compaction interval of each room
    pub flush_interval: Duration,
    /// Idle eviction sweep interval
    pub cleanup_interval: Duration,
    /// How long a detached session's resume token stays valid
    pub resume_token_ttl: Duration,
    pub max_rooms: usize,
    pub max_clients_per_room: usize,
    pub sync: SyncConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(300),
            flush_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            resume_token_ttl: Duration::from_secs(600),
            max_rooms: 1000,
            max_clients_per_room: 64,
            sync: SyncConfig::default(),
        }
    }
}

/// Room statistics, computed on request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomStats {
    pub room_id: RoomId,
    /// Distinct clients with an open session
    pub client_count: usize,
    /// Open sessions, including ones still handshaking
    pub session_count: usize,
    /// Sessions past the state-vector exchange
    pub synced_count: usize,
    /// Live elements per replica
    pub replica_sizes: IndexMap<String, usize>,
    pub awareness_count: usize,
    /// Operations retained for incremental resync
    pub history_len: usize,
    /// Resume tokens the room still honours, live sessions included
    pub resume_tokens: usize,
    /// Whether changes are waiting for the next flush
    pub dirty: bool,
}

/// Errors that can occur in room operations
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Room not found: {0}")]
    NotFound(RoomId),

    #[error("Room is full: {0}")]
    Full(RoomId),

    #[error("Too many rooms (max: {0})")]
    TooManyRooms(usize),

    #[error("Room closed: {0}")]
    Closed(RoomId),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
}

/// Result type for room operations
pub type RoomResult<T> = Result<T, RoomError>;
