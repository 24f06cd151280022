//! The per-room task.
//!
//! A room actor owns the room's [`ReplicaStore`], its awareness table and
//! its sessions. Everything that touches them arrives as a [`RoomCommand`]
//! on one unbounded queue, so a room never needs a lock. Only persistence
//! awaits inside the loop.

use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{RegistryConfig, RoomError, RoomResult, RoomStats};
use crate::crdt::{ExportedDocument, Operation, ReplicaStore, StateVector};
use crate::storage::SnapshotStore;
use crate::sync::protocol::PROTOCOL_VERSION;
use crate::sync::{
    generate_session_token, Awareness, ClientInfo, ErrorCode, RoomId, SessionId, WireMessage,
};

/// Client id of the room's own store and awareness table
const ROOM_CLIENT: &str = "~room";

pub(crate) struct Joined {
    pub session_id: SessionId,
    pub outbound: mpsc::UnboundedReceiver<WireMessage>,
}

pub(crate) enum RoomCommand {
    Join {
        client: ClientInfo,
        resume_token: Option<String>,
        reply: oneshot::Sender<RoomResult<Joined>>,
    },
    Inbound {
        session_id: SessionId,
        message: WireMessage,
    },
    /// The session's connection went away without a goodbye
    Detach { session_id: SessionId },
    Leave {
        client_id: String,
        reply: oneshot::Sender<bool>,
    },
    Stats { reply: oneshot::Sender<RoomStats> },
    Export {
        reply: oneshot::Sender<ExportedDocument>,
    },
    Flush {
        reply: oneshot::Sender<RoomResult<bool>>,
    },
    /// Stop if the room has been empty for `idle_grace` and its flush succeeds
    Evict {
        idle_grace: Duration,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<RoomResult<()>>,
    },
}

struct Peer {
    client: ClientInfo,
    tx: mpsc::UnboundedSender<WireMessage>,
    token: String,
    /// Past the state-vector exchange; receives relayed updates
    relaying: bool,
    /// Resume failed; answer the next sync request with a snapshot
    force_snapshot: bool,
}

struct ResumeEntry {
    client_id: String,
    /// Last state the client acknowledged
    state_vector: StateVector,
    last_seen: Instant,
}

pub(crate) struct Room {
    room_id: RoomId,
    store: ReplicaStore,
    awareness: Awareness,
    peers: IndexMap<SessionId, Peer>,
    tokens: HashMap<String, ResumeEntry>,
    storage: Arc<dyn SnapshotStore>,
    config: RegistryConfig,
    dirty: bool,
    empty_since: Option<Instant>,
}

impl Room {
    pub(crate) fn new(
        room_id: RoomId,
        store: ReplicaStore,
        storage: Arc<dyn SnapshotStore>,
        config: RegistryConfig,
    ) -> Self {
        let awareness = Awareness::new(ROOM_CLIENT, config.sync.awareness_timeout());
        Self {
            room_id,
            store,
            awareness,
            peers: IndexMap::new(),
            tokens: HashMap::new(),
            storage,
            config,
            dirty: false,
            empty_since: Some(Instant::now()),
        }
    }

    /// Start the actor; the room lives until its queue closes or it is evicted
    pub(crate) fn spawn(
        room_id: RoomId,
        store: ReplicaStore,
        storage: Arc<dyn SnapshotStore>,
        config: RegistryConfig,
    ) -> mpsc::UnboundedSender<RoomCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let room = Room::new(room_id, store, storage, config);
        tokio::spawn(room.run(rx));
        tx
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RoomCommand>) {
        let flush_period = self.config.flush_interval;
        let heartbeat_period = self.config.sync.heartbeat_interval;
        let mut flush = tokio::time::interval_at(Instant::now() + flush_period, flush_period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(room = %self.room_id, "room actor started");
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        // registry dropped us; keep what we have
                        let _ = self.flush().await;
                        break;
                    };
                    if !self.handle(cmd).await {
                        break;
                    }
                }
                _ = flush.tick() => {
                    let _ = self.flush().await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat();
                }
            }
        }
        debug!(room = %self.room_id, "room actor stopped");
    }

    /// Returns false when the actor should stop
    async fn handle(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Join {
                client,
                resume_token,
                reply,
            } => {
                let _ = reply.send(self.join(client, resume_token));
            }
            RoomCommand::Inbound {
                session_id,
                message,
            } => self.inbound(&session_id, message),
            RoomCommand::Detach { session_id } => {
                if let Some(peer) = self.remove_peer(&session_id) {
                    info!(room = %self.room_id, client = %peer.client.client_id, session = %session_id, "session detached");
                }
            }
            RoomCommand::Leave { client_id, reply } => {
                let _ = reply.send(self.leave(&client_id, "left the room"));
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            RoomCommand::Export { reply } => {
                let _ = reply.send(self.store.export());
            }
            RoomCommand::Flush { reply } => {
                let _ = reply.send(self.flush().await);
            }
            RoomCommand::Evict { idle_grace, reply } => {
                let idle = self.peers.is_empty()
                    && self
                        .empty_since
                        .map_or(false, |since| since.elapsed() >= idle_grace);
                if !idle {
                    let _ = reply.send(false);
                    return true;
                }
                match self.flush().await {
                    Ok(_) => {
                        info!(room = %self.room_id, "evicting idle room");
                        let _ = reply.send(true);
                        return false;
                    }
                    Err(_) => {
                        let _ = reply.send(false);
                    }
                }
            }
            RoomCommand::Shutdown { reply } => {
                for peer in self.peers.values() {
                    let _ = peer.tx.send(WireMessage::Goodbye {
                        reason: Some("server shutting down".to_string()),
                    });
                }
                self.peers.clear();
                let result = self.flush().await.map(|_| ());
                let _ = reply.send(result);
                return false;
            }
        }
        true
    }

    fn join(&mut self, client: ClientInfo, resume_token: Option<String>) -> RoomResult<Joined> {
        let superseded: Vec<SessionId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.client.client_id == client.client_id)
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in superseded {
            if let Some(peer) = self.peers.shift_remove(&session_id) {
                let _ = peer.tx.send(WireMessage::Goodbye {
                    reason: Some("superseded by a newer session".to_string()),
                });
                info!(room = %self.room_id, client = %client.client_id, session = %session_id, "session superseded");
            }
        }

        if self.peers.len() >= self.config.max_clients_per_room {
            warn!(room = %self.room_id, client = %client.client_id, "room full, join rejected");
            return Err(RoomError::Full(self.room_id.clone()));
        }

        let mut acknowledged = StateVector::new();
        let mut force_snapshot = false;
        if let Some(token) = resume_token {
            match self.tokens.remove(&token) {
                Some(entry) if entry.client_id == client.client_id => {
                    acknowledged = entry.state_vector;
                }
                _ => {
                    warn!(room = %self.room_id, client = %client.client_id, "unknown resume token, full resync");
                    force_snapshot = true;
                }
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let token = generate_session_token();
        let (tx, outbound) = mpsc::unbounded_channel();
        let _ = tx.send(WireMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            session_id: session_id.clone(),
            resume_token: token.clone(),
            server_time: chrono::Utc::now().timestamp_millis(),
            client_clock: self.store.state_vector().get(&client.client_id),
        });

        self.tokens.insert(
            token.clone(),
            ResumeEntry {
                client_id: client.client_id.clone(),
                state_vector: acknowledged,
                last_seen: Instant::now(),
            },
        );
        info!(room = %self.room_id, client = %client.client_id, session = %session_id, "session joined");
        self.peers.insert(
            session_id.clone(),
            Peer {
                client,
                tx,
                token,
                relaying: false,
                force_snapshot,
            },
        );
        self.empty_since = None;

        Ok(Joined {
            session_id,
            outbound,
        })
    }

    fn remove_peer(&mut self, session_id: &str) -> Option<Peer> {
        let peer = self.peers.shift_remove(session_id)?;
        if self.peers.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        Some(peer)
    }

    /// Drop every session of `client_id` along with its presence and tokens
    fn leave(&mut self, client_id: &str, reason: &str) -> bool {
        let sessions: Vec<SessionId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.client.client_id == client_id)
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in &sessions {
            if let Some(peer) = self.remove_peer(session_id) {
                let _ = peer.tx.send(WireMessage::Goodbye {
                    reason: Some(reason.to_string()),
                });
            }
        }
        self.tokens.retain(|_, entry| entry.client_id != client_id);

        let had_presence = self.awareness.remove(client_id);
        if had_presence {
            self.broadcast_removal(client_id);
        }
        if !sessions.is_empty() {
            info!(room = %self.room_id, client = %client_id, "client left");
        }
        !sessions.is_empty() || had_presence
    }

    fn send_to(&self, session_id: &str, msg: WireMessage) {
        if let Some(peer) = self.peers.get(session_id) {
            let _ = peer.tx.send(msg);
        }
    }

    /// Send to every synced session except `except`
    fn broadcast(&self, except: Option<&str>, msg: &WireMessage) {
        for (session_id, peer) in &self.peers {
            if !peer.relaying || Some(session_id.as_str()) == except {
                continue;
            }
            let _ = peer.tx.send(msg.clone());
        }
    }

    fn broadcast_removal(&self, client_id: &str) {
        self.broadcast(
            None,
            &WireMessage::AwarenessUpdate {
                client_id: client_id.to_string(),
                fields: None,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        );
    }

    fn inbound(&mut self, session_id: &str, message: WireMessage) {
        let Some(peer) = self.peers.get(session_id) else {
            debug!(room = %self.room_id, session = %session_id, "message for unknown session dropped");
            return;
        };
        let client_id = peer.client.client_id.clone();

        match message {
            WireMessage::SyncRequest { state_vector } => {
                self.sync_request(session_id, state_vector)
            }
            WireMessage::SyncResponse { operations } | WireMessage::Update { operations } => {
                self.operations(session_id, operations)
            }
            WireMessage::Ack { state_vector } => {
                if let Some(entry) = self.tokens.get_mut(&peer.token) {
                    entry.state_vector = state_vector;
                    entry.last_seen = Instant::now();
                }
            }
            WireMessage::AwarenessUpdate {
                client_id: claimed,
                fields,
                timestamp,
            } => {
                if claimed != client_id {
                    warn!(room = %self.room_id, session = %session_id, %claimed, "awareness update for another client rejected");
                    self.send_to(
                        session_id,
                        WireMessage::error(
                            ErrorCode::Unauthorized,
                            "awareness updates must carry the session's client id",
                        ),
                    );
                    return;
                }
                self.awareness
                    .apply_update(&claimed, fields.clone(), timestamp);
                self.broadcast(
                    Some(session_id),
                    &WireMessage::AwarenessUpdate {
                        client_id: claimed,
                        fields,
                        timestamp,
                    },
                );
            }
            WireMessage::Goodbye { .. } => {
                if let Some(peer) = self.remove_peer(session_id) {
                    self.tokens.remove(&peer.token);
                }
                if self.awareness.remove(&client_id) {
                    self.broadcast_removal(&client_id);
                }
                info!(room = %self.room_id, client = %client_id, session = %session_id, "session said goodbye");
            }
            other => {
                warn!(room = %self.room_id, session = %session_id, kind = ?other.message_type(), "unexpected message rejected");
                self.send_to(
                    session_id,
                    WireMessage::error(ErrorCode::InvalidMessage, "unexpected message"),
                );
            }
        }
    }

    fn sync_request(&mut self, session_id: &str, state_vector: StateVector) {
        let force_snapshot = self
            .peers
            .get(session_id)
            .map_or(false, |peer| peer.force_snapshot);

        let reply = match self.store.ops_missing(&state_vector) {
            Some(operations) if !force_snapshot => WireMessage::SyncResponse { operations },
            _ => {
                warn!(room = %self.room_id, session = %session_id, "version conflict, sending snapshot");
                self.send_to(
                    session_id,
                    WireMessage::error(
                        ErrorCode::VersionConflict,
                        "history no longer covers this session; sending a snapshot",
                    ),
                );
                WireMessage::Snapshot {
                    state: Box::new(self.store.to_state()),
                }
            }
        };
        self.send_to(session_id, reply);
        self.send_to(
            session_id,
            WireMessage::SyncRequest {
                state_vector: self.store.state_vector().clone(),
            },
        );
        for update in self.awareness.snapshot_messages() {
            self.send_to(session_id, update);
        }

        if let Some(peer) = self.peers.get_mut(session_id) {
            peer.force_snapshot = false;
            peer.relaying = true;
            if let Some(entry) = self.tokens.get_mut(&peer.token) {
                entry.state_vector = state_vector;
                entry.last_seen = Instant::now();
            }
        }
    }

    fn operations(&mut self, session_id: &str, operations: Vec<Operation>) {
        if operations.is_empty() {
            return;
        }
        let before = self.store.history().len();
        let outcome = self.store.apply_remote_batch(operations);
        if outcome.buffered > 0 {
            debug!(room = %self.room_id, session = %session_id, buffered = outcome.buffered, "operations waiting on dependencies");
        }
        if outcome.is_noop() {
            return;
        }

        // newly applied operations are appended to history in application order
        let fresh = self.store.history()[before..].to_vec();
        self.dirty = true;
        self.broadcast(Some(session_id), &WireMessage::Update { operations: fresh });
    }

    fn heartbeat(&mut self) {
        for client_id in self.awareness.remove_stale() {
            debug!(room = %self.room_id, client = %client_id, "awareness expired");
            self.broadcast_removal(&client_id);
        }

        let now = Instant::now();
        let live: HashSet<&str> = self.peers.values().map(|p| p.token.as_str()).collect();
        for (token, entry) in self.tokens.iter_mut() {
            if live.contains(token.as_str()) {
                entry.last_seen = now;
            }
        }
        let ttl = self.config.resume_token_ttl;
        let before = self.tokens.len();
        self.tokens
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= ttl);
        if self.tokens.len() < before {
            debug!(room = %self.room_id, expired = before - self.tokens.len(), "resume tokens expired");
        }
    }

    /// Everything every known session has acknowledged
    fn compaction_horizon(&self) -> StateVector {
        self.tokens
            .values()
            .map(|entry| &entry.state_vector)
            .fold(None, |acc: Option<StateVector>, sv| {
                Some(match acc {
                    Some(horizon) => horizon.meet(sv),
                    None => sv.clone(),
                })
            })
            .unwrap_or_else(|| self.store.state_vector().clone())
    }

    /// Compact history, then save if anything changed. Returns whether a save happened.
    async fn flush(&mut self) -> RoomResult<bool> {
        let horizon = self.compaction_horizon();
        let dropped = self.store.compact(&horizon);
        if dropped > 0 {
            debug!(room = %self.room_id, dropped, "history compacted");
            self.dirty = true;
        }
        if !self.dirty {
            return Ok(false);
        }

        let state = self.store.to_state();
        match self.storage.save(&self.room_id, &state).await {
            Ok(()) => {
                self.dirty = false;
                debug!(room = %self.room_id, "room flushed");
                Ok(true)
            }
            Err(e) => {
                error!(room = %self.room_id, error = %e, "failed to flush room");
                Err(e.into())
            }
        }
    }

    fn stats(&self) -> RoomStats {
        let clients: HashSet<&str> = self
            .peers
            .values()
            .map(|peer| peer.client.client_id.as_str())
            .collect();
        RoomStats {
            room_id: self.room_id.clone(),
            client_count: clients.len(),
            session_count: self.peers.len(),
            synced_count: self.peers.values().filter(|peer| peer.relaying).count(),
            replica_sizes: self.store.replica_sizes(),
            awareness_count: self.awareness.len(),
            history_len: self.store.history().len(),
            resume_tokens: self.tokens.len(),
            dirty: self.dirty,
        }
    }
}

/// A fresh store for a room, restored from `state` when one was persisted
pub(crate) fn room_store(state: Option<crate::crdt::DocumentState>) -> ReplicaStore {
    match state {
        Some(state) => ReplicaStore::from_state(ROOM_CLIENT, state),
        None => ReplicaStore::new(ROOM_CLIENT),
    }
}
