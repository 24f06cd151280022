//! Client side of a room connection.
//!
//! A session task owns the link, runs the state-vector handshake, keeps the
//! link alive with heartbeats and reconnects with jittered exponential
//! backoff. Reconnecting always redoes the handshake, so whatever either
//! side missed while apart is exchanged exactly once.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::awareness::Awareness;
use super::protocol::{ErrorCode, WireMessage};
use super::transport::{Connector, Link, TransportError};
use super::{ClientInfo, RoomId, SessionId, SyncConfig};
use crate::crdt::{OpId, ReplicaStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Synced,
    /// Link is up but a resync is outstanding
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Connected { session_id: SessionId },
    Disconnected { reason: String },
    /// Handshake finished: operations received from and sent to the room
    Synced { received: usize, sent: usize },
    /// Remote operations applied to the local store
    Applied { ops: Vec<OpId> },
    /// Local store replaced from a room snapshot
    SnapshotLoaded,
    Awareness { client_id: String },
    VersionConflict { message: String },
    Error { message: String },
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

/// Exponential backoff with full jitter
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Upper bound of the next delay
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(20));
        self.policy
            .base
            .checked_mul(factor)
            .unwrap_or(self.policy.max)
            .min(self.policy.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let cap = self.ceiling().as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Shared state a session reads and writes
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<Mutex<ReplicaStore>>,
    pub awareness: Arc<Mutex<Awareness>>,
}

enum Command {
    Send(WireMessage),
    Resync,
    Close,
    /// Drop the link without a goodbye so the room keeps the resume token
    Abandon,
}

enum LinkEnd {
    /// Closed on request; stop for good
    Closed,
    /// Lost; reconnect after backoff
    Lost { reason: String, was_synced: bool },
}

pub struct TransportSession {
    connector: Arc<dyn Connector>,
    room_id: RoomId,
    client: ClientInfo,
    resume_token: Arc<Mutex<Option<String>>>,
    ctx: SessionContext,
    config: SyncConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl TransportSession {
    /// Start a session task; it connects in the background and keeps reconnecting until closed
    pub fn connect(
        connector: Arc<dyn Connector>,
        room_id: impl Into<RoomId>,
        client: ClientInfo,
        resume_token: Option<String>,
        ctx: SessionContext,
        config: SyncConfig,
    ) -> SessionHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(1024);
        let resume_token = Arc::new(Mutex::new(resume_token));

        let session = TransportSession {
            connector,
            room_id: room_id.into(),
            client,
            resume_token: resume_token.clone(),
            ctx,
            config,
            commands,
            state_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(session.run());

        SessionHandle {
            commands: commands_tx,
            state: state_rx,
            events,
            resume_token,
            task: Some(task),
        }
    }

    fn set_state(&self, state: SessionState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            let _ = self.state_tx.send(state);
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff_policy());

        loop {
            self.set_state(SessionState::Connecting);
            let token = self.resume_token.lock().clone();
            let timeout = self.config.handshake_timeout;
            let opened =
                tokio::time::timeout(timeout, self.connector.open(&self.room_id, &self.client, token))
                    .await
                    .unwrap_or(Err(TransportError::HandshakeTimeout(timeout)));

            match opened {
                Ok(link) => match self.drive(link).await {
                    LinkEnd::Closed => break,
                    LinkEnd::Lost { reason, was_synced } => {
                        info!(room = %self.room_id, %reason, "session link lost");
                        self.emit(SessionEvent::Disconnected { reason });
                        if was_synced {
                            backoff.reset();
                        }
                    }
                },
                Err(err) => {
                    debug!(room = %self.room_id, error = %err, "connect attempt failed");
                    self.emit(SessionEvent::Error {
                        message: err.to_string(),
                    });
                }
            }

            self.set_state(SessionState::Disconnected);
            if !self.wait_backoff(backoff.next_delay()).await {
                break;
            }
        }

        self.set_state(SessionState::Disconnected);
        debug!(room = %self.room_id, client = %self.client.client_id, "session closed");
    }

    /// Sleep before reconnecting. Returns false when the session was closed meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Close) | Some(Command::Abandon) => return false,
                    // a resync request while offline just means "try now"
                    Some(Command::Resync) => return true,
                    // edits stay in history; the next handshake carries them
                    Some(Command::Send(_)) => {}
                },
            }
        }
    }

    async fn drive(&mut self, mut link: Link) -> LinkEnd {
        // the sync request goes out once the room's welcome names our clock
        self.set_state(SessionState::Handshaking);

        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut synced = false;
        let mut received = 0usize;

        loop {
            tokio::select! {
                _ = &mut deadline, if !synced => {
                    warn!(room = %self.room_id, "handshake timed out");
                    return LinkEnd::Lost {
                        reason: TransportError::HandshakeTimeout(self.config.handshake_timeout).to_string(),
                        was_synced: false,
                    };
                }
                msg = link.inbound.recv() => {
                    let Some(msg) = msg else {
                        return LinkEnd::Lost { reason: "connection closed".to_string(), was_synced: synced };
                    };
                    if let Some(end) = self.handle_inbound(msg, &link, &mut synced, &mut received) {
                        return end;
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Close) => {
                        let _ = link.outbound.send(WireMessage::Goodbye { reason: Some("client closed".to_string()) });
                        return LinkEnd::Closed;
                    }
                    Some(Command::Abandon) => {
                        debug!(room = %self.room_id, "link abandoned, resume token kept");
                        return LinkEnd::Closed;
                    }
                    Some(Command::Send(msg)) => {
                        let is_awareness = matches!(msg, WireMessage::AwarenessUpdate { .. });
                        let ready = *self.state_tx.borrow() == SessionState::Synced;
                        if (ready || is_awareness) && link.outbound.send(msg).is_err() {
                            return LinkEnd::Lost { reason: "connection closed".to_string(), was_synced: synced };
                        }
                    }
                    Some(Command::Resync) => {
                        self.set_state(SessionState::Degraded);
                        received = 0;
                        let state_vector = self.ctx.store.lock().handshake_vector();
                        let _ = link.outbound.send(WireMessage::SyncRequest { state_vector });
                    }
                },
                _ = heartbeat.tick(), if synced => {
                    self.heartbeat(&link);
                }
            }
        }
    }

    fn heartbeat(&self, link: &Link) {
        let (update, expired) = {
            let mut awareness = self.ctx.awareness.lock();
            (awareness.local_update(), awareness.remove_stale())
        };
        if let Some(update) = update {
            let _ = link.outbound.send(update);
        }
        let state_vector = self.ctx.store.lock().state_vector().clone();
        let _ = link.outbound.send(WireMessage::Ack { state_vector });
        for client_id in expired {
            self.emit(SessionEvent::Awareness { client_id });
        }
    }

    fn handle_inbound(
        &mut self,
        msg: WireMessage,
        link: &Link,
        synced: &mut bool,
        received: &mut usize,
    ) -> Option<LinkEnd> {
        match msg {
            WireMessage::Welcome {
                session_id,
                resume_token,
                client_clock,
                ..
            } => {
                *self.resume_token.lock() = Some(resume_token);
                self.emit(SessionEvent::Connected { session_id });

                let state_vector = {
                    let mut store = self.ctx.store.lock();
                    store.adopt_room_clock(client_clock);
                    store.handshake_vector()
                };
                if link
                    .outbound
                    .send(WireMessage::SyncRequest { state_vector })
                    .is_err()
                {
                    return Some(LinkEnd::Lost {
                        reason: "link closed before handshake".to_string(),
                        was_synced: false,
                    });
                }
            }
            WireMessage::Error { code, message } => {
                if code == ErrorCode::VersionConflict {
                    warn!(room = %self.room_id, %message, "version conflict, expecting snapshot");
                    self.set_state(SessionState::Degraded);
                    self.emit(SessionEvent::VersionConflict { message });
                } else {
                    self.emit(SessionEvent::Error {
                        message: format!("{:?}: {}", code, message),
                    });
                }
            }
            WireMessage::SyncResponse { operations } | WireMessage::Update { operations } => {
                let outcome = self.ctx.store.lock().apply_remote_batch(operations);
                *received += outcome.applied.len();
                if !outcome.applied.is_empty() {
                    self.emit(SessionEvent::Applied {
                        ops: outcome.applied,
                    });
                }
            }
            WireMessage::Snapshot { state } => {
                let carried = self.ctx.store.lock().reset_from(*state);
                debug!(room = %self.room_id, carried = carried.len(), "loaded room snapshot");
                self.emit(SessionEvent::SnapshotLoaded);
            }
            WireMessage::SyncRequest { state_vector } => {
                let missing = self
                    .ctx
                    .store
                    .lock()
                    .ops_missing(&state_vector)
                    .unwrap_or_default();
                let sent = missing.len();
                if link
                    .outbound
                    .send(WireMessage::SyncResponse {
                        operations: missing,
                    })
                    .is_err()
                {
                    return Some(LinkEnd::Lost {
                        reason: "connection closed".to_string(),
                        was_synced: *synced,
                    });
                }
                if let Some(update) = self.ctx.awareness.lock().local_update() {
                    let _ = link.outbound.send(update);
                }
                *synced = true;
                self.set_state(SessionState::Synced);
                self.emit(SessionEvent::Synced {
                    received: *received,
                    sent,
                });
                *received = 0;
            }
            WireMessage::AwarenessUpdate {
                client_id,
                fields,
                timestamp,
            } => {
                let changed = self
                    .ctx
                    .awareness
                    .lock()
                    .apply_update(&client_id, fields, timestamp);
                if changed {
                    self.emit(SessionEvent::Awareness { client_id });
                }
            }
            WireMessage::Goodbye { reason } => {
                return Some(LinkEnd::Lost {
                    reason: reason.unwrap_or_else(|| "server said goodbye".to_string()),
                    was_synced: *synced,
                });
            }
            WireMessage::Ack { .. } => {}
            WireMessage::Hello { .. } => {
                debug!(room = %self.room_id, "ignoring unexpected hello");
            }
        }
        None
    }
}

/// Handle to a running session. Dropping it closes the session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    resume_token: Arc<Mutex<Option<String>>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_synced(&self) -> bool {
        self.state() == SessionState::Synced
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Queue a message; updates are only sent while synced
    pub fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.commands
            .send(Command::Send(message))
            .map_err(|_| TransportError::Closed)
    }

    /// Redo the state-vector exchange on the current link
    pub fn resync(&self) -> Result<(), TransportError> {
        self.commands
            .send(Command::Resync)
            .map_err(|_| TransportError::Closed)
    }

    pub fn resume_token(&self) -> Option<String> {
        self.resume_token.lock().clone()
    }

    /// Wait until the session reaches `target`, or fail after `timeout`
    pub async fn wait_for_state(
        &self,
        target: SessionState,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        wait_for(self.state.clone(), target, timeout).await
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Say goodbye and stop reconnecting
    pub async fn close(mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Stop without a goodbye and hand back the resume token, which the
    /// room keeps honouring until it expires
    pub async fn abandon(mut self) -> Option<String> {
        let _ = self.commands.send(Command::Abandon);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.resume_token()
    }
}

pub(crate) async fn wait_for(
    mut state: watch::Receiver<SessionState>,
    target: SessionState,
    timeout: Duration,
) -> Result<(), TransportError> {
    let wait = async {
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            if state.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .unwrap_or(Err(TransportError::HandshakeTimeout(timeout)))
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}
