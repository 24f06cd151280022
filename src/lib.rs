//! Room Synchronization Engine
//!
//! Real-time collaboration over CRDT replicas:
//! - Text, file-tree and shape-set replicas with causal delivery
//! - Rooms served by one actor task each, persisted to sled
//! - Client sessions with state-vector handshakes and reconnect backoff
//! - Ephemeral awareness (cursors, selections, user info)
//! - Local undo/redo that leaves other clients' work alone

pub mod client;
pub mod config;
pub mod crdt;
pub mod error;
pub mod room;
pub mod storage;
pub mod sync;

pub use client::{ClientConfig, ClientStats, CollabClient};
pub use config::ServerConfig;
pub use crdt::{Intent, OpId, Operation, ReplicaKind, ReplicaStore, StateVector};
pub use error::{CollabError, CollabResult};
pub use room::{RegistryConfig, RoomHandle, RoomRegistry, RoomStats};
pub use storage::{MemoryStore, SledStore, SnapshotStore, StorageConfig};
pub use sync::{
    AwarenessFields, ClientInfo, LocalConnector, SessionEvent, SessionState, SyncConfig,
    WireMessage, WsConnector,
};
