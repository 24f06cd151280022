//! In-memory snapshot store for tests and ephemeral servers.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{SnapshotMetadata, SnapshotStore, StorageError, StorageResult};
use crate::crdt::DocumentState;

/// Keeps snapshots in a map; saves and loads can be made to fail
#[derive(Default)]
pub struct MemoryStore {
    snapshots: DashMap<String, (DocumentState, SnapshotMetadata)>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.snapshots.contains_key(room_id)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, room_id: &str, state: &DocumentState) -> StorageResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("saves disabled".to_string()));
        }
        let size = state.encode()?.len() as u64;
        let meta = SnapshotMetadata::for_state(room_id, state, size);
        self.snapshots
            .insert(room_id.to_string(), (state.clone(), meta));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, room_id: &str) -> StorageResult<Option<DocumentState>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("loads disabled".to_string()));
        }
        Ok(self
            .snapshots
            .get(room_id)
            .map(|entry| entry.value().0.clone()))
    }

    async fn delete(&self, room_id: &str) -> StorageResult<bool> {
        Ok(self.snapshots.remove(room_id).is_some())
    }

    async fn list(&self) -> StorageResult<Vec<SnapshotMetadata>> {
        Ok(self
            .snapshots
            .iter()
            .map(|entry| entry.value().1.clone())
            .collect())
    }
}
