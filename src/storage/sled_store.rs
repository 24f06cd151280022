//! Sled-based snapshot storage.
//!
//! Each room has one record in the `snapshots` tree:
//! `[format u8][sha256 of payload, 32 bytes][bincode DocumentState]`.
//! The digest is checked on load so a torn or corrupted write surfaces as
//! [`StorageError::Corruption`] instead of a half-decoded document.
//! Sled calls are blocking and run on the blocking thread pool.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{SnapshotMetadata, SnapshotStore, StorageConfig, StorageError, StorageResult};
use crate::crdt::DocumentState;

/// Tree names for different data types
const TREE_SNAPSHOTS: &str = "snapshots";
const TREE_METADATA: &str = "metadata";

const FORMAT_V1: u8 = 1;
const DIGEST_LEN: usize = 32;

/// Owns the database and flushes it once, when the last store handle drops
struct DbHandle(Db);

impl Drop for DbHandle {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.0.flush();
    }
}

/// The trees a blocking call works on
#[derive(Clone)]
struct Trees {
    snapshots: Tree,
    metadata: Tree,
}

/// Sled-backed [`SnapshotStore`]
#[derive(Clone)]
pub struct SledStore {
    db: Arc<DbHandle>,
    trees: Trees,
}

impl SledStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let trees = Trees {
            snapshots: db.open_tree(TREE_SNAPSHOTS)?,
            metadata: db.open_tree(TREE_METADATA)?,
        };

        Ok(Self {
            db: Arc::new(DbHandle(db)),
            trees,
        })
    }

    /// Number of stored snapshots
    pub fn len(&self) -> usize {
        self.trees.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.snapshots.is_empty()
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.0.flush()?;
        Ok(())
    }

    /// Runs `f` on the blocking pool with its own handles to the trees
    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Trees) -> StorageResult<T> + Send + 'static,
    {
        let trees = self.trees.clone();
        tokio::task::spawn_blocking(move || f(trees))
            .await
            .map_err(|e| StorageError::Unavailable(format!("storage task failed: {}", e)))?
    }
}

impl Trees {
    fn save(&self, room_id: &str, state: &DocumentState) -> StorageResult<()> {
        let record = encode_record(state)?;
        let meta = SnapshotMetadata::for_state(room_id, state, record.len() as u64);
        let meta_bytes = bincode::serialize(&meta)?;

        self.snapshots.insert(room_id.as_bytes(), record)?;
        self.metadata.insert(room_id.as_bytes(), meta_bytes)?;
        self.snapshots.flush()?;
        debug!(room = %room_id, bytes = meta.size_bytes, "snapshot written");
        Ok(())
    }

    fn load(&self, room_id: &str) -> StorageResult<Option<DocumentState>> {
        match self.snapshots.get(room_id.as_bytes())? {
            Some(record) => decode_record(room_id, &record).map(Some),
            None => Ok(None),
        }
    }

    fn delete(&self, room_id: &str) -> StorageResult<bool> {
        let existed = self.snapshots.remove(room_id.as_bytes())?.is_some();
        self.metadata.remove(room_id.as_bytes())?;
        Ok(existed)
    }

    fn list(&self) -> StorageResult<Vec<SnapshotMetadata>> {
        let mut rooms = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            rooms.push(bincode::deserialize(&value)?);
        }
        Ok(rooms)
    }
}

fn encode_record(state: &DocumentState) -> StorageResult<Vec<u8>> {
    let payload = state.encode()?;
    let digest = Sha256::digest(&payload);

    let mut record = Vec::with_capacity(1 + DIGEST_LEN + payload.len());
    record.push(FORMAT_V1);
    record.extend_from_slice(&digest);
    record.extend_from_slice(&payload);
    Ok(record)
}

fn decode_record(room_id: &str, record: &[u8]) -> StorageResult<DocumentState> {
    if record.len() < 1 + DIGEST_LEN {
        return Err(StorageError::Corruption(format!(
            "{}: record too short ({} bytes)",
            room_id,
            record.len()
        )));
    }
    if record[0] != FORMAT_V1 {
        return Err(StorageError::Corruption(format!(
            "{}: unknown record format {}",
            room_id, record[0]
        )));
    }

    let (digest, payload) = record[1..].split_at(DIGEST_LEN);
    if Sha256::digest(payload).as_slice() != digest {
        return Err(StorageError::Corruption(format!(
            "{}: digest mismatch",
            room_id
        )));
    }
    Ok(DocumentState::decode(payload)?)
}

#[async_trait]
impl SnapshotStore for SledStore {
    async fn save(&self, room_id: &str, state: &DocumentState) -> StorageResult<()> {
        let room_id = room_id.to_string();
        let state = state.clone();
        self.blocking(move |trees| trees.save(&room_id, &state)).await
    }

    async fn load(&self, room_id: &str) -> StorageResult<Option<DocumentState>> {
        let room_id = room_id.to_string();
        self.blocking(move |trees| trees.load(&room_id)).await
    }

    async fn delete(&self, room_id: &str) -> StorageResult<bool> {
        let room_id = room_id.to_string();
        self.blocking(move |trees| trees.delete(&room_id)).await
    }

    async fn list(&self) -> StorageResult<Vec<SnapshotMetadata>> {
        self.blocking(|trees| trees.list()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Intent, NodeKind, ReplicaStore, ROOT_ID};
    use tempfile::{tempdir, TempDir};

    fn test_store() -> (TempDir, SledStore) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string())
            .with_flush_interval_ms(0);
        let store = SledStore::open(config).unwrap();
        (dir, store)
    }

    fn sample_state() -> DocumentState {
        let mut doc = ReplicaStore::new("alice");
        doc.apply_local(
            "main.rs",
            Intent::InsertText {
                index: 0,
                text: "fn main() {}".into(),
            },
        )
        .unwrap();
        doc.apply_local(
            "file-tree",
            Intent::CreateNode {
                node: "src".into(),
                parent: ROOT_ID.into(),
                name: "src".into(),
                kind: NodeKind::Folder,
                order_hint: 0.0,
            },
        )
        .unwrap();
        doc.to_state()
    }

    #[tokio::test]
    async fn test_snapshot_save_load() {
        let (_dir, store) = test_store();
        let state = sample_state();

        store.save("room-1", &state).await.unwrap();
        let loaded = store.load("room-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_snapshot_not_found() {
        let (_dir, store) = test_store();
        assert!(store.load("nonexistent").await.unwrap().is_none());
        assert!(!store.delete("nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_lists_rooms() {
        let (_dir, store) = test_store();
        store.save("room-a", &sample_state()).await.unwrap();
        store.save("room-b", &sample_state()).await.unwrap();

        let mut rooms = store.list().await.unwrap();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].room_id, "room-a");
        assert_eq!(
            rooms[0].replicas,
            vec!["main.rs".to_string(), "file-tree".to_string()]
        );
        assert!(rooms[0].size_bytes > 0);
    }

    #[tokio::test]
    async fn test_delete_snapshot() {
        let (_dir, store) = test_store();
        store.save("to-delete", &sample_state()).await.unwrap();
        assert_eq!(store.len(), 1);

        assert!(store.delete("to-delete").await.unwrap());
        assert!(store.load("to-delete").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_record_is_detected() {
        let (_dir, store) = test_store();
        store.save("room-1", &sample_state()).await.unwrap();

        let mut record = store.trees.snapshots.get("room-1").unwrap().unwrap().to_vec();
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        store.trees.snapshots.insert("room-1", record).unwrap();

        let result = store.load("room-1").await;
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[tokio::test]
    async fn test_storage_calls_share_one_db_handle() {
        let (_dir, store) = test_store();
        store.save("room-1", &sample_state()).await.unwrap();
        store.load("room-1").await.unwrap();
        store.list().await.unwrap();
        assert_eq!(Arc::strong_count(&store.db), 1);

        let other = store.clone();
        assert_eq!(Arc::strong_count(&store.db), 2);
        drop(other);
        assert_eq!(Arc::strong_count(&store.db), 1);
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.sled").to_string_lossy().to_string();
        let state = sample_state();
        {
            let store = SledStore::open(StorageConfig::new(path.clone())).unwrap();
            store.save("room-1", &state).await.unwrap();
        }
        let store = SledStore::open(StorageConfig::new(path)).unwrap();
        assert_eq!(store.load("room-1").await.unwrap(), Some(state));
    }
}
