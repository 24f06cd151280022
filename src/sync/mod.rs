//! Replication between clients and rooms.
//!
//! This module provides:
//! - Binary wire protocol for session traffic
//! - Ephemeral awareness (cursors, selections, online users)
//! - Transport connectors (in-process and WebSocket)
//! - The reconnecting client session with state-vector resync

pub mod awareness;
pub mod protocol;
pub mod session;
pub mod transport;

pub use awareness::{Awareness, AwarenessEvent, AwarenessFields, AwarenessState};
pub use protocol::{ErrorCode, WireCodec, WireMessage};
pub use session::{SessionEvent, SessionHandle, SessionState, TransportSession};
pub use transport::{Connector, LocalConnector, TransportError, WsConnector};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::crdt::ClientId;

/// Unique identifier for a room
pub type RoomId = String;

/// Identifier of one connection of a client to a room
pub type SessionId = String;

/// Who a client is, as announced in the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub user_name: String,
    pub color: String,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<ClientId>, user_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            user_name: user_name.into(),
            color: generate_color(),
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

/// Timing of sessions and awareness
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Awareness retransmit and acknowledgement period
    pub heartbeat_interval: Duration,
    /// Peers silent for this many heartbeats are dropped from awareness
    pub awareness_timeout_multiplier: u32,
    /// Bound on connecting plus the state-vector exchange
    pub handshake_timeout: Duration,
    /// First reconnect delay ceiling
    pub backoff_base: Duration,
    /// Largest reconnect delay ceiling
    pub backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            awareness_timeout_multiplier: 3,
            handshake_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn awareness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.awareness_timeout_multiplier.max(1)
    }

    pub fn backoff_policy(&self) -> session::BackoffPolicy {
        session::BackoffPolicy {
            base: self.backoff_base,
            max: self.backoff_max,
        }
    }
}

/// Generate an unguessable resume token
pub fn generate_session_token() -> String {
    use sha2::{Digest, Sha256};
    let random_bytes: [u8; 32] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Pick a display color for a user
pub fn generate_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#a855f7", // purple
        "#84cc16", // lime
        "#6366f1", // indigo
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}
