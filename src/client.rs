//! Client API for a collaborative room.
//!
//! A [`CollabClient`] owns a local replica store, its awareness view and an
//! undo manager. Local edits apply immediately and are forwarded to the room
//! when a session is synced; anything that could not be sent is carried by
//! the next handshake.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::crdt::{
    undo::DEFAULT_CAPTURE_TIMEOUT, Applied, ExportedDocument, Intent, NodeId, Operation,
    ReplicaStore, Subscription, UndoManager,
};
use crate::error::{CollabError, CollabResult};
use crate::room::{FileTreeManager, NestedNode};
use crate::sync::session::{self, SessionContext};
use crate::sync::{
    Awareness, AwarenessFields, AwarenessState, ClientInfo, Connector, RoomId, SessionEvent,
    SessionHandle, SessionState, SyncConfig, TransportSession, WireMessage,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub sync: SyncConfig,
    /// Local edits closer together than this undo as one step
    pub undo_capture_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            undo_capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }
}

/// Point-in-time view of a client
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub client_id: String,
    pub room_id: RoomId,
    pub state: SessionState,
    pub replica_sizes: indexmap::IndexMap<String, usize>,
    pub history_len: usize,
    /// Remote operations waiting on missing dependencies
    pub pending: usize,
    pub awareness_count: usize,
    pub can_undo: bool,
    pub can_redo: bool,
}

pub struct CollabClient {
    room_id: RoomId,
    client: ClientInfo,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    store: Arc<Mutex<ReplicaStore>>,
    awareness: Arc<Mutex<Awareness>>,
    undo: Mutex<UndoManager>,
    files: FileTreeManager,
    session: Mutex<Option<SessionHandle>>,
    /// Token of the last session that went away without a goodbye
    resume_token: Mutex<Option<String>>,
}

impl CollabClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        room_id: impl Into<RoomId>,
        client: ClientInfo,
        config: ClientConfig,
    ) -> Self {
        let client_id = client.client_id.clone();
        Self {
            room_id: room_id.into(),
            store: Arc::new(Mutex::new(ReplicaStore::new(client_id.clone()))),
            awareness: Arc::new(Mutex::new(Awareness::new(
                client_id.clone(),
                config.sync.awareness_timeout(),
            ))),
            undo: Mutex::new(UndoManager::new(client_id, config.undo_capture_timeout)),
            files: FileTreeManager::new(),
            session: Mutex::new(None),
            resume_token: Mutex::new(None),
            client,
            config,
            connector,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client.client_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Start a session in the background.
    ///
    /// A session already running is superseded: its link is dropped and its
    /// resume token handed to the new session, as is the token left by
    /// [`suspend`](Self::suspend).
    pub async fn connect(&self) -> CollabResult<()> {
        let previous = self.session.lock().take();
        let superseded = match previous {
            Some(previous) => previous.abandon().await,
            None => None,
        };
        let resume_token = superseded.or_else(|| self.resume_token.lock().take());

        let ctx = SessionContext {
            store: self.store.clone(),
            awareness: self.awareness.clone(),
        };
        info!(
            room = %self.room_id,
            client = %self.client.client_id,
            resuming = resume_token.is_some(),
            "client connecting"
        );
        let handle = TransportSession::connect(
            self.connector.clone(),
            self.room_id.clone(),
            self.client.clone(),
            resume_token,
            ctx,
            self.config.sync.clone(),
        );
        *self.session.lock() = Some(handle);
        Ok(())
    }

    /// Drop the link without leaving the room. The next [`connect`](Self::connect)
    /// resumes the session while the room still honours its token.
    pub async fn suspend(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            let token = session.abandon().await;
            *self.resume_token.lock() = token;
        }
        self.drop_remote_presence();
        debug!(room = %self.room_id, client = %self.client.client_id, "client suspended");
    }

    /// Leave the room. Local state is kept; remote presence is dropped.
    pub async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
        // the goodbye made the room forget the token
        self.resume_token.lock().take();
        self.drop_remote_presence();
        debug!(room = %self.room_id, client = %self.client.client_id, "client disconnected");
    }

    /// Token a later `connect` will present, if any
    pub fn resume_token(&self) -> Option<String> {
        match self.session.lock().as_ref() {
            Some(session) => session.resume_token(),
            None => self.resume_token.lock().clone(),
        }
    }

    fn drop_remote_presence(&self) {
        let mut awareness = self.awareness.lock();
        let remote: Vec<String> = awareness
            .get_states()
            .into_keys()
            .filter(|id| id != &self.client.client_id)
            .collect();
        for client_id in remote {
            awareness.remove(&client_id);
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .lock()
            .as_ref()
            .map_or(SessionState::Disconnected, |s| s.state())
    }

    pub fn is_synced(&self) -> bool {
        self.state() == SessionState::Synced
    }

    /// Wait for the handshake to finish.
    ///
    /// Fails with [`CollabError::VersionConflict`] when the room reported a
    /// conflict and no snapshot settled it within `timeout`.
    pub async fn wait_until_synced(&self, timeout: Duration) -> CollabResult<()> {
        let (state, mut events) = {
            let session = self.session.lock();
            let session = session.as_ref().ok_or(CollabError::NotConnected)?;
            (session.state_watch(), session.subscribe())
        };
        let Err(err) = session::wait_for(state, SessionState::Synced, timeout).await else {
            return Ok(());
        };
        let mut conflict = None;
        loop {
            match events.try_recv() {
                Ok(SessionEvent::VersionConflict { message }) => conflict = Some(message),
                Ok(SessionEvent::SnapshotLoaded) => conflict = None,
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        match conflict {
            Some(message) => Err(CollabError::VersionConflict(message)),
            None => Err(err.into()),
        }
    }

    /// Session lifecycle events, for the session currently running
    pub fn session_events(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.session.lock().as_ref().map(|s| s.subscribe())
    }

    /// Redo the state-vector exchange without reconnecting
    pub fn resync(&self) -> CollabResult<()> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(CollabError::NotConnected)?;
        session.resync()?;
        Ok(())
    }

    pub fn get_awareness(&self) -> HashMap<String, AwarenessState> {
        self.awareness.lock().get_states()
    }

    /// Publish local presence; kept and re-sent after reconnects
    pub fn set_awareness(&self, fields: AwarenessFields) {
        let update = self.awareness.lock().set_local_state(fields);
        self.forward(update);
    }

    pub fn clear_awareness(&self) {
        let update = self.awareness.lock().clear_local_state();
        self.forward(update);
    }

    pub fn subscribe(&self, replica: &str) -> Subscription {
        self.store.lock().subscribe(replica)
    }

    /// Apply a local edit and send it to the room
    pub fn apply_local(&self, replica: &str, intent: Intent) -> CollabResult<Operation> {
        let applied = self.store.lock().apply_local_tracked(replica, intent)?;
        Ok(self.committed(applied))
    }

    fn committed(&self, applied: Applied) -> Operation {
        self.undo_manager().record(&applied);
        self.publish(vec![applied.op.clone()]);
        applied.op
    }

    fn publish(&self, operations: Vec<Operation>) {
        if !operations.is_empty() {
            self.forward(WireMessage::Update { operations });
        }
    }

    fn forward(&self, message: WireMessage) {
        if let Some(session) = self.session.lock().as_ref() {
            // a closed session drops it; history still holds the edit
            let _ = session.send(message);
        }
    }

    pub fn text(&self, replica: &str) -> Option<String> {
        self.store.lock().text(replica)
    }

    /// Run `f` against the local store without mutating it
    pub fn read<T>(&self, f: impl FnOnce(&ReplicaStore) -> T) -> T {
        f(&self.store.lock())
    }

    // File tree

    pub fn create_file(&self, parent: &str, name: &str) -> CollabResult<NodeId> {
        let (node, applied) = self
            .files
            .create_file(&mut self.store.lock(), parent, name)?;
        self.committed(applied);
        Ok(node)
    }

    pub fn create_folder(&self, parent: &str, name: &str) -> CollabResult<NodeId> {
        let (node, applied) = self
            .files
            .create_folder(&mut self.store.lock(), parent, name)?;
        self.committed(applied);
        Ok(node)
    }

    pub fn rename(&self, node: &str, name: &str) -> CollabResult<()> {
        let applied = self.files.rename(&mut self.store.lock(), node, name)?;
        self.committed(applied);
        Ok(())
    }

    pub fn move_node(&self, node: &str, new_parent: &str) -> CollabResult<()> {
        let applied = self
            .files
            .move_node(&mut self.store.lock(), node, new_parent)?;
        self.committed(applied);
        Ok(())
    }

    pub fn delete_node(&self, node: &str) -> CollabResult<()> {
        let applied = self.files.delete_node(&mut self.store.lock(), node)?;
        self.committed(applied);
        Ok(())
    }

    pub fn file_tree(&self) -> NestedNode {
        self.files.to_nested(&self.store.lock())
    }

    pub fn path_of(&self, node: &str) -> Option<String> {
        self.files.path_of(&self.store.lock(), node)
    }

    // Undo

    /// The undo manager, emptied first when a handshake re-stamped local
    /// operations, since its entries name the old ids
    fn undo_manager(&self) -> MutexGuard<'_, UndoManager> {
        let mut undo = self.undo.lock();
        let rebased = self.store.lock().take_rebased();
        if rebased {
            debug!(room = %self.room_id, client = %self.client.client_id, "local ids re-stamped, undo history dropped");
            undo.clear();
        }
        undo
    }

    pub fn recordable_scope(&self, replica: &str) {
        self.undo.lock().recordable_scope(replica);
    }

    /// Close the current undo step so the next edit starts a new one
    pub fn stop_capturing(&self) {
        self.undo.lock().stop_capturing();
    }

    /// Revert the latest local step. Returns the operations it emitted.
    pub fn undo(&self) -> Vec<Operation> {
        let ops = self.undo_manager().undo(&mut self.store.lock());
        self.publish(ops.clone());
        ops
    }

    pub fn redo(&self) -> Vec<Operation> {
        let ops = self.undo_manager().redo(&mut self.store.lock());
        self.publish(ops.clone());
        ops
    }

    pub fn can_undo(&self) -> bool {
        self.undo_manager().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo_manager().can_redo()
    }

    pub fn export_snapshot(&self) -> ExportedDocument {
        self.store.lock().export()
    }

    /// Remove every live element of every replica. Refused unless `force`.
    pub fn clear_room(&self, force: bool) -> CollabResult<usize> {
        if !force {
            return Err(CollabError::Validation(
                "clearing a room deletes everything; pass force to confirm".to_string(),
            ));
        }

        let ops = {
            let mut store = self.store.lock();
            let mut ops = Vec::new();
            for (replica, intent) in store.clear_intents() {
                ops.push(store.apply_local(&replica, intent)?);
            }
            ops
        };
        self.undo.lock().clear();
        let cleared = ops.len();
        info!(room = %self.room_id, client = %self.client.client_id, cleared, "room cleared");
        self.publish(ops);
        Ok(cleared)
    }

    pub fn stats(&self) -> ClientStats {
        let (replica_sizes, history_len, pending) = {
            let store = self.store.lock();
            (
                store.replica_sizes(),
                store.history().len(),
                store.pending_len(),
            )
        };
        let undo = self.undo_manager();
        ClientStats {
            client_id: self.client.client_id.clone(),
            room_id: self.room_id.clone(),
            state: self.state(),
            replica_sizes,
            history_len,
            pending,
            awareness_count: self.awareness.lock().len(),
            can_undo: undo.can_undo(),
            can_redo: undo.can_redo(),
        }
    }
}
