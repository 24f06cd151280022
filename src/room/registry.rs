//! Registry of live rooms.
//!
//! This module provides:
//! - Lazy room creation, restoring persisted snapshots
//! - DashMap of room actors, no global lock
//! - Idle eviction and shutdown flushing

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::actor::{room_store, Room, RoomCommand};
use super::{RegistryConfig, RoomError, RoomResult, RoomStats};
use crate::crdt::{ExportedDocument, ReplicaStore};
use crate::storage::SnapshotStore;
use crate::sync::{ClientInfo, RoomId, SessionId, WireMessage};

/// A session's end of a room
pub struct RoomHandle {
    room_id: RoomId,
    session_id: SessionId,
    client_id: String,
    commands: mpsc::UnboundedSender<RoomCommand>,
    outbound: mpsc::UnboundedReceiver<WireMessage>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Hand a client message to the room
    pub fn send(&self, message: WireMessage) -> RoomResult<()> {
        self.commands
            .send(RoomCommand::Inbound {
                session_id: self.session_id.clone(),
                message,
            })
            .map_err(|_| RoomError::Closed(self.room_id.clone()))
    }

    /// Next message for the client; `None` once the room dropped the session
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.outbound.recv().await
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(RoomCommand::Detach {
            session_id: self.session_id.clone(),
        });
    }
}

pub struct RoomRegistry {
    rooms: DashMap<RoomId, mpsc::UnboundedSender<RoomCommand>>,
    storage: Arc<dyn SnapshotStore>,
    config: RegistryConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl RoomRegistry {
    pub fn new(storage: Arc<dyn SnapshotStore>, config: RegistryConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            rooms: DashMap::new(),
            storage,
            config,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn SnapshotStore> {
        &self.storage
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Number of rooms currently in memory
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_loaded(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    fn sender(&self, room_id: &str) -> Option<mpsc::UnboundedSender<RoomCommand>> {
        self.rooms
            .get(room_id)
            .map(|entry| entry.value().clone())
            .filter(|tx| !tx.is_closed())
    }

    /// Drop a dead actor's entry, unless it was already replaced
    fn forget(&self, room_id: &str, dead: &mpsc::UnboundedSender<RoomCommand>) {
        self.rooms.remove_if(room_id, |_, tx| tx.same_channel(dead));
    }

    /// The room's actor, restoring or creating the room if it is not in memory
    async fn room_sender(&self, room_id: &str) -> RoomResult<mpsc::UnboundedSender<RoomCommand>> {
        if let Some(tx) = self.sender(room_id) {
            return Ok(tx);
        }
        if self.rooms.len() >= self.config.max_rooms {
            return Err(RoomError::TooManyRooms(self.config.max_rooms));
        }

        // load outside the map so other rooms are not blocked on storage
        let state = self.storage.load(room_id).await.map_err(|e| {
            warn!(room = %room_id, error = %e, "failed to load room snapshot");
            RoomError::from(e)
        })?;
        let restored = state.is_some();

        let tx = match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    // another join won the race
                    return Ok(entry.get().clone());
                }
                let tx = Room::spawn(
                    room_id.to_string(),
                    room_store(state),
                    self.storage.clone(),
                    self.config.clone(),
                );
                entry.insert(tx.clone());
                tx
            }
            Entry::Vacant(entry) => {
                let tx = Room::spawn(
                    room_id.to_string(),
                    room_store(state),
                    self.storage.clone(),
                    self.config.clone(),
                );
                entry.insert(tx.clone());
                tx
            }
        };

        if restored {
            info!(room = %room_id, "restored room from snapshot");
        } else {
            info!(room = %room_id, "created room");
        }
        Ok(tx)
    }

    /// Join a room, creating or restoring it on first use
    pub async fn join_room(
        &self,
        room_id: &str,
        client: ClientInfo,
        resume_token: Option<String>,
    ) -> RoomResult<RoomHandle> {
        if room_id.trim().is_empty() {
            return Err(RoomError::Validation("room id must not be empty".into()));
        }
        if client.client_id.trim().is_empty() {
            return Err(RoomError::Validation("client id must not be empty".into()));
        }

        // one retry covers joining a room that is being evicted right now
        for _ in 0..2 {
            let commands = self.room_sender(room_id).await?;
            let (reply, rx) = oneshot::channel();
            let sent = commands.send(RoomCommand::Join {
                client: client.clone(),
                resume_token: resume_token.clone(),
                reply,
            });
            if sent.is_err() {
                self.forget(room_id, &commands);
                continue;
            }
            match rx.await {
                Ok(joined) => {
                    let joined = joined?;
                    return Ok(RoomHandle {
                        room_id: room_id.to_string(),
                        session_id: joined.session_id,
                        client_id: client.client_id.clone(),
                        commands,
                        outbound: joined.outbound,
                    });
                }
                Err(_) => {
                    debug!(room = %room_id, "room stopped during join, retrying");
                    self.forget(room_id, &commands);
                }
            }
        }
        Err(RoomError::Closed(room_id.to_string()))
    }

    async fn request<T>(
        &self,
        room_id: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> RoomResult<T> {
        let commands = self
            .sender(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(make(reply))
            .map_err(|_| RoomError::Closed(room_id.to_string()))?;
        rx.await.map_err(|_| RoomError::Closed(room_id.to_string()))
    }

    /// Remove every session of `client_id` from a room. Returns whether anything was removed.
    pub async fn leave_room(&self, room_id: &str, client_id: &str) -> RoomResult<bool> {
        let client_id = client_id.to_string();
        self.request(room_id, |reply| RoomCommand::Leave { client_id, reply })
            .await
    }

    pub async fn get_stats(&self, room_id: &str) -> RoomResult<RoomStats> {
        self.request(room_id, |reply| RoomCommand::Stats { reply })
            .await
    }

    /// Plain values of every replica; falls back to the stored snapshot for unloaded rooms
    pub async fn export_room(&self, room_id: &str) -> RoomResult<ExportedDocument> {
        if self.sender(room_id).is_some() {
            return self
                .request(room_id, |reply| RoomCommand::Export { reply })
                .await;
        }
        match self.storage.load(room_id).await? {
            Some(state) => Ok(ReplicaStore::from_state("export", state).export()),
            None => Err(RoomError::NotFound(room_id.to_string())),
        }
    }

    /// Flush every room now. Returns how many rooms were saved.
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<RoomId> = self.room_ids();
        let mut saved = 0;
        for room_id in rooms {
            match self
                .request(&room_id, |reply| RoomCommand::Flush { reply })
                .await
            {
                Ok(Ok(true)) => saved += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(room = %room_id, error = %e, "flush failed"),
                Err(e) => debug!(room = %room_id, error = %e, "room gone before flush"),
            }
        }
        saved
    }

    /// Evict rooms that have been empty past the idle grace. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let rooms: Vec<(RoomId, mpsc::UnboundedSender<RoomCommand>)> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0;
        for (room_id, commands) in rooms {
            let (reply, rx) = oneshot::channel();
            let idle_grace = self.config.idle_grace;
            if commands
                .send(RoomCommand::Evict { idle_grace, reply })
                .is_err()
            {
                self.forget(&room_id, &commands);
                continue;
            }
            if let Ok(true) = rx.await {
                self.forget(&room_id, &commands);
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "evicted idle rooms");
        }
        evicted
    }

    /// Say goodbye to every session, flush every room and stop their actors
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let rooms: Vec<(RoomId, mpsc::UnboundedSender<RoomCommand>)> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (room_id, commands) in rooms {
            let (reply, rx) = oneshot::channel();
            if commands.send(RoomCommand::Shutdown { reply }).is_ok() {
                if let Ok(Err(e)) = rx.await {
                    warn!(room = %room_id, error = %e, "final flush failed");
                }
            }
            self.forget(&room_id, &commands);
        }
        info!("room registry shut down");
    }

    /// Start the idle eviction loop
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let registry = self.clone();
        let cleanup_interval = registry.config.cleanup_interval;

        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = registry.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.evict_idle().await;
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            cleanup_task: cleanup_handle,
        }
    }
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.cleanup_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Intent, ReplicaValue};
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn registry_with(storage: Arc<MemoryStore>, config: RegistryConfig) -> RoomRegistry {
        RoomRegistry::new(storage, config)
    }

    fn quick_config() -> RegistryConfig {
        RegistryConfig {
            idle_grace: Duration::ZERO,
            ..RegistryConfig::default()
        }
    }

    async fn push_text(handle: &mut RoomHandle, client: &str, text: &str) {
        let mut store = ReplicaStore::new(client);
        let op = store
            .apply_local(
                "notes",
                Intent::InsertText {
                    index: 0,
                    text: text.into(),
                },
            )
            .unwrap();
        handle
            .send(WireMessage::SyncRequest {
                state_vector: Default::default(),
            })
            .unwrap();
        handle
            .send(WireMessage::Update {
                operations: vec![op],
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_creates_room_and_welcomes() {
        let registry = registry_with(Arc::new(MemoryStore::new()), RegistryConfig::default());
        let mut handle = registry
            .join_room("room-1", ClientInfo::new("alice", "Alice"), None)
            .await
            .unwrap();

        assert!(matches!(handle.recv().await, Some(WireMessage::Welcome { .. })));
        assert_eq!(registry.room_count(), 1);
        let stats = registry.get_stats("room-1").await.unwrap();
        assert_eq!(stats.session_count, 1);
        assert_eq!(stats.client_count, 1);
    }

    #[tokio::test]
    async fn test_empty_ids_are_rejected() {
        let registry = registry_with(Arc::new(MemoryStore::new()), RegistryConfig::default());
        assert!(matches!(
            registry
                .join_room("", ClientInfo::new("alice", "Alice"), None)
                .await,
            Err(RoomError::Validation(_))
        ));
        assert!(matches!(
            registry
                .join_room("room", ClientInfo::new(" ", "Alice"), None)
                .await,
            Err(RoomError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_for_unknown_room() {
        let registry = registry_with(Arc::new(MemoryStore::new()), RegistryConfig::default());
        assert!(matches!(
            registry.get_stats("nope").await,
            Err(RoomError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_failure_fails_the_join() {
        let storage = Arc::new(MemoryStore::new());
        storage.set_fail_loads(true);
        let registry = registry_with(storage, RegistryConfig::default());

        let result = registry
            .join_room("room-1", ClientInfo::new("alice", "Alice"), None)
            .await;
        assert!(matches!(result, Err(RoomError::Persistence(_))));
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_room_is_flushed_evicted_and_restored() {
        let storage = Arc::new(MemoryStore::new());
        let registry = registry_with(storage.clone(), quick_config());

        let mut handle = registry
            .join_room("room-1", ClientInfo::new("alice", "Alice"), None)
            .await
            .unwrap();
        push_text(&mut handle, "alice", "persisted").await;
        let stats = registry.get_stats("room-1").await.unwrap();
        assert_eq!(stats.replica_sizes.get("notes"), Some(&9));

        // occupied rooms stay
        assert_eq!(registry.evict_idle().await, 0);
        drop(handle);
        // let the detach land before the sweep
        registry.get_stats("room-1").await.unwrap();
        assert_eq!(registry.evict_idle().await, 1);
        assert_eq!(registry.room_count(), 0);
        assert!(storage.contains("room-1"));

        let exported = registry.export_room("room-1").await.unwrap();
        assert_eq!(
            exported.replicas.get("notes"),
            Some(&ReplicaValue::Text("persisted".into()))
        );

        let _again = registry
            .join_room("room-1", ClientInfo::new("bob", "Bob"), None)
            .await
            .unwrap();
        let stats = registry.get_stats("room-1").await.unwrap();
        assert_eq!(stats.replica_sizes.get("notes"), Some(&9));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_room_in_memory() {
        let storage = Arc::new(MemoryStore::new());
        let registry = registry_with(storage.clone(), quick_config());
        let mut handle = registry
            .join_room("room-1", ClientInfo::new("alice", "Alice"), None)
            .await
            .unwrap();
        push_text(&mut handle, "alice", "unsaved").await;
        drop(handle);
        registry.get_stats("room-1").await.unwrap();

        storage.set_fail_saves(true);
        assert_eq!(registry.evict_idle().await, 0);
        assert!(registry.is_loaded("room-1"));

        storage.set_fail_saves(false);
        assert_eq!(registry.evict_idle().await, 1);
        assert!(storage.contains("room-1"));
    }

    #[tokio::test]
    async fn test_leave_room_closes_session() {
        let registry = registry_with(Arc::new(MemoryStore::new()), RegistryConfig::default());
        let mut handle = registry
            .join_room("room-1", ClientInfo::new("alice", "Alice"), None)
            .await
            .unwrap();
        assert!(matches!(handle.recv().await, Some(WireMessage::Welcome { .. })));

        assert!(registry.leave_room("room-1", "alice").await.unwrap());
        assert!(matches!(handle.recv().await, Some(WireMessage::Goodbye { .. })));
        assert!(handle.recv().await.is_none());
        assert!(!registry.leave_room("room-1", "alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_rooms() {
        let storage = Arc::new(MemoryStore::new());
        let registry = registry_with(storage.clone(), RegistryConfig::default());
        let mut handle = registry
            .join_room("room-1", ClientInfo::new("alice", "Alice"), None)
            .await
            .unwrap();
        push_text(&mut handle, "alice", "bye").await;
        registry.get_stats("room-1").await.unwrap();

        registry.shutdown().await;
        assert_eq!(registry.room_count(), 0);
        assert!(storage.contains("room-1"));
    }
}
