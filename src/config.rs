//! Server configuration from the environment.
//!
//! `.env` is loaded first when present; unset variables keep their defaults.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::room::RegistryConfig;
use crate::storage::StorageConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            storage: StorageConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `.env` and the process environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unknown keys fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = ServerConfig::default();

        if let Some(port) = parse::<u16>(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = path;
        }

        let registry = &mut config.registry;
        if let Some(secs) = parse::<u64>(&lookup, "ROOM_IDLE_GRACE_SECS")? {
            registry.idle_grace = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "FLUSH_INTERVAL_MS")? {
            anyhow::ensure!(ms > 0, "FLUSH_INTERVAL_MS must be positive");
            registry.flush_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>(&lookup, "MAX_ROOMS")? {
            registry.max_rooms = n;
        }
        if let Some(n) = parse::<usize>(&lookup, "MAX_CLIENTS_PER_ROOM")? {
            registry.max_clients_per_room = n;
        }

        let sync = &mut registry.sync;
        if let Some(ms) = parse::<u64>(&lookup, "HEARTBEAT_INTERVAL_MS")? {
            anyhow::ensure!(ms > 0, "HEARTBEAT_INTERVAL_MS must be positive");
            sync.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<u32>(&lookup, "AWARENESS_TIMEOUT_MULTIPLIER")? {
            sync.awareness_timeout_multiplier = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "HANDSHAKE_TIMEOUT_MS")? {
            sync.handshake_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {}: {:?}", key, raw))
        })
        .transpose()
}
