//! Per-room document: named replicas, causal delivery and resync history.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use super::shapes::{ShapeSetReplica, ShapeView};
use super::text::TextReplica;
use super::tree::{TreeNodeView, TreeReplica};
use super::{
    ClientId, CrdtError, CrdtResult, Intent, OpId, Operation, Payload, ReplicaKind, Revert,
    StateVector,
};

/// A single named replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Replica {
    Text(TextReplica),
    Tree(TreeReplica),
    Shapes(ShapeSetReplica),
}

impl Replica {
    pub fn new(kind: ReplicaKind) -> Self {
        match kind {
            ReplicaKind::Text => Replica::Text(TextReplica::new()),
            ReplicaKind::Tree => Replica::Tree(TreeReplica::new()),
            ReplicaKind::Shapes => Replica::Shapes(ShapeSetReplica::new()),
        }
    }

    pub fn kind(&self) -> ReplicaKind {
        match self {
            Replica::Text(_) => ReplicaKind::Text,
            Replica::Tree(_) => ReplicaKind::Tree,
            Replica::Shapes(_) => ReplicaKind::Shapes,
        }
    }

    /// Number of live elements (characters, nodes or shapes)
    pub fn len(&self) -> usize {
        match self {
            Replica::Text(r) => r.len(),
            Replica::Tree(r) => r.len(),
            Replica::Shapes(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self) -> ReplicaValue {
        match self {
            Replica::Text(r) => ReplicaValue::Text(r.text()),
            Replica::Tree(r) => ReplicaValue::Tree(r.nodes()),
            Replica::Shapes(r) => ReplicaValue::Shapes(r.shapes()),
        }
    }

    fn prepare(&self, intent: &Intent) -> CrdtResult<Payload> {
        match self {
            Replica::Text(r) => r.prepare(intent).map(Payload::Text),
            Replica::Tree(r) => r.prepare(intent).map(Payload::Tree),
            Replica::Shapes(r) => r.prepare(intent).map(Payload::Shapes),
        }
    }

    fn apply(&mut self, id: &OpId, payload: &Payload) -> Option<Revert> {
        match (self, payload) {
            (Replica::Text(r), Payload::Text(op)) => r.apply(id, op).map(Revert::Text),
            (Replica::Tree(r), Payload::Tree(op)) => r.apply(id, op).map(Revert::Tree),
            (Replica::Shapes(r), Payload::Shapes(op)) => r.apply(id, op).map(Revert::Shapes),
            _ => None,
        }
    }

    fn revert_intents(&self, id: &OpId, revert: &Revert, local: &str) -> Vec<Intent> {
        match (self, revert) {
            (Replica::Text(r), Revert::Text(revert)) => r.revert_intents(revert, local),
            (Replica::Tree(r), Revert::Tree(revert)) => r.revert_intents(id, revert),
            (Replica::Shapes(r), Revert::Shapes(revert)) => r.revert_intents(id, revert),
            _ => Vec::new(),
        }
    }

    fn clear_intents(&self) -> Vec<Intent> {
        match self {
            Replica::Text(r) => r.clear_intents(),
            Replica::Tree(r) => r.clear_intents(),
            Replica::Shapes(r) => r.clear_intents(),
        }
    }
}

/// Plain snapshot of a replica, as handed to UI panels and exports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ReplicaValue {
    Text(String),
    Tree(Vec<TreeNodeView>),
    Shapes(Vec<ShapeView>),
}

/// Every replica of a document as plain values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedDocument {
    pub replicas: IndexMap<String, ReplicaValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Change notification delivered to subscribers of a replica
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaEvent {
    pub replica: String,
    pub origin: Origin,
    /// Operations applied; empty when the replica was replaced wholesale
    pub ops: Vec<OpId>,
}

/// Receives change events for one replica. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    replica: String,
    rx: mpsc::UnboundedReceiver<ReplicaEvent>,
}

impl Subscription {
    pub fn replica(&self) -> &str {
        &self.replica
    }

    pub async fn recv(&mut self) -> Option<ReplicaEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReplicaEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<ReplicaEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// A local operation together with what it replaced
#[derive(Debug, Clone)]
pub struct Applied {
    pub op: Operation,
    pub revert: Option<Revert>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// Operations applied, in application order
    pub applied: Vec<OpId>,
    /// Operations from the batch still waiting on dependencies
    pub buffered: usize,
    /// Operations already known
    pub duplicates: usize,
    /// Buffered operations discarded because the buffer was full
    pub dropped: usize,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Full CRDT state of a document, for persistence and full resync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub replicas: Vec<(String, Replica)>,
    pub state_vector: StateVector,
    pub floor: StateVector,
    pub history: Vec<Operation>,
    pub clock: u64,
}

impl DocumentState {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn replica_names(&self) -> Vec<String> {
        self.replicas.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Default cap on operations waiting for their dependencies
pub const DEFAULT_PENDING_LIMIT: usize = 10_000;

/// The document of one room as seen by one participant
#[derive(Debug)]
pub struct ReplicaStore {
    client_id: ClientId,
    clock: u64,
    replicas: IndexMap<String, Replica>,
    state_vector: StateVector,
    /// History below this vector has been compacted away
    floor: StateVector,
    history: Vec<Operation>,
    /// Remote operations waiting on dependencies, oldest first
    pending: IndexMap<OpId, Operation>,
    pending_limit: usize,
    /// Whether the ids of local operations are known not to clash with the room's
    own_ids_confirmed: bool,
    /// Set during a handshake when the room already holds operations of this
    /// client id up to the given clock; the next remote batch re-stamps local work
    rebase_above: Option<u64>,
    rebased: bool,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<ReplicaEvent>>>,
}

impl ReplicaStore {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            clock: 0,
            replicas: IndexMap::new(),
            state_vector: StateVector::new(),
            floor: StateVector::new(),
            history: Vec::new(),
            pending: IndexMap::new(),
            pending_limit: DEFAULT_PENDING_LIMIT,
            own_ids_confirmed: false,
            rebase_above: None,
            rebased: false,
            subscribers: HashMap::new(),
        }
    }

    /// Restore a store whose own operations were already exchanged with the room
    pub fn from_state(client_id: impl Into<ClientId>, state: DocumentState) -> Self {
        let mut store = Self::new(client_id);
        store.replicas = state.replicas.into_iter().collect();
        store.state_vector = state.state_vector;
        store.floor = state.floor;
        store.history = state.history;
        store.clock = state.clock;
        store.own_ids_confirmed = true;
        store
    }

    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit.max(1);
        self
    }

    pub fn to_state(&self) -> DocumentState {
        DocumentState {
            replicas: self
                .replicas
                .iter()
                .map(|(name, replica)| (name.clone(), replica.clone()))
                .collect(),
            state_vector: self.state_vector.clone(),
            floor: self.floor.clone(),
            history: self.history.clone(),
            clock: self.clock,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn floor(&self) -> &StateVector {
        &self.floor
    }

    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn replica(&self, name: &str) -> Option<&Replica> {
        self.replicas.get(name)
    }

    pub fn replica_names(&self) -> Vec<String> {
        self.replicas.keys().cloned().collect()
    }

    pub fn replica_sizes(&self) -> IndexMap<String, usize> {
        self.replicas
            .iter()
            .map(|(name, replica)| (name.clone(), replica.len()))
            .collect()
    }

    pub fn get_snapshot(&self, name: &str) -> Option<ReplicaValue> {
        self.replicas.get(name).map(Replica::value)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        match self.replicas.get(name) {
            Some(Replica::Text(r)) => Some(r.text()),
            _ => None,
        }
    }

    pub fn text_replica(&self, name: &str) -> Option<&TextReplica> {
        match self.replicas.get(name) {
            Some(Replica::Text(r)) => Some(r),
            _ => None,
        }
    }

    pub fn tree(&self, name: &str) -> Option<&TreeReplica> {
        match self.replicas.get(name) {
            Some(Replica::Tree(r)) => Some(r),
            _ => None,
        }
    }

    pub fn shapes(&self, name: &str) -> Option<&ShapeSetReplica> {
        match self.replicas.get(name) {
            Some(Replica::Shapes(r)) => Some(r),
            _ => None,
        }
    }

    pub fn export(&self) -> ExportedDocument {
        ExportedDocument {
            replicas: self
                .replicas
                .iter()
                .map(|(name, replica)| (name.clone(), replica.value()))
                .collect(),
        }
    }

    pub fn subscribe(&mut self, replica: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(replica.to_string())
            .or_default()
            .push(tx);
        Subscription {
            replica: replica.to_string(),
            rx,
        }
    }

    pub fn subscriber_count(&self, replica: &str) -> usize {
        self.subscribers
            .get(replica)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    fn notify(&mut self, replica: &str, origin: Origin, ops: Vec<OpId>) {
        if let Some(subs) = self.subscribers.get_mut(replica) {
            let event = ReplicaEvent {
                replica: replica.to_string(),
                origin,
                ops,
            };
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Validate a local edit, turn it into an operation and apply it
    pub fn apply_local(&mut self, replica: &str, intent: Intent) -> CrdtResult<Operation> {
        self.apply_local_tracked(replica, intent)
            .map(|applied| applied.op)
    }

    /// Like [`apply_local`](Self::apply_local), also returning what the operation replaced
    pub fn apply_local_tracked(&mut self, replica: &str, intent: Intent) -> CrdtResult<Applied> {
        let kind = intent.kind();
        let payload = match self.replicas.get(replica) {
            Some(existing) if existing.kind() != kind => {
                return Err(CrdtError::KindMismatch {
                    name: replica.to_string(),
                    expected: kind,
                    actual: existing.kind(),
                })
            }
            Some(existing) => existing.prepare(&intent)?,
            None => Replica::new(kind).prepare(&intent)?,
        };

        let op = Operation {
            replica: replica.to_string(),
            id: OpId::new(self.clock + 1, self.client_id.clone()),
            payload,
            depends_on: self.state_vector.heads(),
        };
        let revert = self.integrate(&op);
        self.notify(replica, Origin::Local, vec![op.id.clone()]);
        Ok(Applied { op, revert })
    }

    /// Whether `op` has neither been applied nor buffered
    pub fn is_new(&self, op: &Operation) -> bool {
        !self.state_vector.contains(&op.id) && !self.pending.contains_key(&op.id)
    }

    /// Take in the room's latest clock for this client id, learned at handshake.
    ///
    /// A store that never exchanged its own operations with the room may
    /// have stamped local edits with ids the room already holds from an
    /// earlier run under the same client id. Those edits are re-stamped
    /// above `room_clock` when the room's operations arrive.
    pub fn adopt_room_clock(&mut self, room_clock: u64) {
        let own = self.state_vector.get(&self.client_id);
        if self.own_ids_confirmed || room_clock == 0 || own == 0 {
            self.clock = self.clock.max(room_clock);
            self.own_ids_confirmed = true;
            self.rebase_above = None;
            return;
        }
        info!(
            client = %self.client_id,
            room_clock,
            local_clock = own,
            "room knows this client id from an earlier run, local edits will be re-stamped"
        );
        self.rebase_above = Some(room_clock);
    }

    /// State vector to announce in a sync request.
    ///
    /// While local ids await re-stamping the own entry is left out, so the
    /// room sends back everything it holds under this client id.
    pub fn handshake_vector(&self) -> StateVector {
        match self.rebase_above {
            Some(_) => self.state_vector.without(&self.client_id),
            None => self.state_vector.clone(),
        }
    }

    /// Whether local operations were re-stamped since the last call
    pub fn take_rebased(&mut self) -> bool {
        std::mem::take(&mut self.rebased)
    }

    fn is_ready(&self, op: &Operation) -> bool {
        op.depends_on
            .iter()
            .all(|dep| self.state_vector.contains(dep))
    }

    pub fn apply_remote(&mut self, op: Operation) -> ApplyOutcome {
        self.apply_remote_batch(vec![op])
    }

    /// Apply remote operations in causal order, buffering those with missing dependencies
    pub fn apply_remote_batch(&mut self, ops: Vec<Operation>) -> ApplyOutcome {
        if let Some(room_clock) = self.rebase_above.take() {
            return self.rebase_onto(ops, room_clock);
        }
        let mut outcome = ApplyOutcome::default();
        let mut touched: IndexMap<String, Vec<OpId>> = IndexMap::new();
        let mut parked: Vec<OpId> = Vec::new();

        for op in ops {
            if !self.is_new(&op) {
                outcome.duplicates += 1;
                continue;
            }
            if self.is_ready(&op) {
                self.integrate(&op);
                touched
                    .entry(op.replica.clone())
                    .or_default()
                    .push(op.id.clone());
                outcome.applied.push(op.id);
                self.drain_pending(&mut outcome, &mut touched);
            } else {
                debug!(op = %op.id, replica = %op.replica, "buffering operation until dependencies arrive");
                parked.push(op.id.clone());
                self.pending.insert(op.id.clone(), op);
                if self.pending.len() > self.pending_limit {
                    if let Some((dropped, _)) = self.pending.shift_remove_index(0) {
                        warn!(op = %dropped, limit = self.pending_limit, "pending buffer full, dropping oldest operation");
                        outcome.dropped += 1;
                    }
                }
            }
        }

        outcome.buffered = parked
            .iter()
            .filter(|id| self.pending.contains_key(*id))
            .count();
        for (replica, ids) in touched {
            self.notify(&replica, Origin::Remote, ids);
        }
        outcome
    }

    fn drain_pending(
        &mut self,
        outcome: &mut ApplyOutcome,
        touched: &mut IndexMap<String, Vec<OpId>>,
    ) {
        loop {
            let Some(index) = self.pending.values().position(|op| self.is_ready(op)) else {
                break;
            };
            let Some((_, op)) = self.pending.shift_remove_index(index) else {
                break;
            };
            if self.state_vector.contains(&op.id) {
                continue;
            }
            self.integrate(&op);
            touched
                .entry(op.replica.clone())
                .or_default()
                .push(op.id.clone());
            outcome.applied.push(op.id);
        }
    }

    fn integrate(&mut self, op: &Operation) -> Option<Revert> {
        let replica = self
            .replicas
            .entry(op.replica.clone())
            .or_insert_with(|| Replica::new(op.payload.kind()));
        let revert = if replica.kind() == op.payload.kind() {
            replica.apply(&op.id, &op.payload)
        } else {
            warn!(
                replica = %op.replica,
                op = %op.id,
                "ignoring operation for a replica of another kind"
            );
            None
        };
        self.state_vector.observe(&op.id);
        self.clock = self.clock.max(op.id.clock);
        self.history.push(op.clone());
        revert
    }

    /// Whether history still holds everything a peer at `remote` is missing
    pub fn can_serve(&self, remote: &StateVector) -> bool {
        remote.dominates(&self.floor)
    }

    /// History operations not covered by `remote`, in application order
    pub fn ops_missing(&self, remote: &StateVector) -> Option<Vec<Operation>> {
        if !self.can_serve(remote) {
            return None;
        }
        Some(
            self.history
                .iter()
                .filter(|op| !remote.contains(&op.id))
                .cloned()
                .collect(),
        )
    }

    /// Drop history every peer already has; returns how many operations were dropped
    pub fn compact(&mut self, horizon: &StateVector) -> usize {
        let horizon = horizon.meet(&self.state_vector);
        let before = self.history.len();
        self.history.retain(|op| !horizon.contains(&op.id));
        self.floor.merge(&horizon);
        before - self.history.len()
    }

    /// Replace the document with `state`, keeping local work the state lacks.
    ///
    /// Returns the operations of this store that `state` did not contain;
    /// they have been re-applied and must be sent to the peer.
    pub fn reset_from(&mut self, state: DocumentState) -> Vec<Operation> {
        let rebase = self.rebase_above.take();
        let (own, others): (Vec<Operation>, Vec<Operation>) = match rebase {
            Some(_) => std::mem::take(&mut self.history)
                .into_iter()
                .partition(|op| op.id.client == self.client_id),
            None => (Vec::new(), std::mem::take(&mut self.history)),
        };
        let mut carried: Vec<Operation> = others
            .into_iter()
            .filter(|op| !state.state_vector.contains(&op.id))
            .collect();
        let pending = std::mem::take(&mut self.pending);

        let previous: HashSet<String> = self.replicas.keys().cloned().collect();
        self.replicas = state.replicas.into_iter().collect();
        self.state_vector = state.state_vector;
        self.floor = state.floor;
        self.history = state.history;
        self.clock = self.clock.max(state.clock);

        let mut replay = carried.clone();
        replay.extend(pending.into_values());
        self.apply_remote_batch(replay);
        if let Some(room_clock) = rebase {
            carried.extend(self.restamp_own(own, room_clock));
        }

        self.notify_replaced(previous);
        carried
    }

    /// Rebuild from the room's operations, then re-apply local work under fresh ids
    fn rebase_onto(&mut self, remote: Vec<Operation>, room_clock: u64) -> ApplyOutcome {
        let (own, others): (Vec<Operation>, Vec<Operation>) = std::mem::take(&mut self.history)
            .into_iter()
            .partition(|op| op.id.client == self.client_id);
        let pending = std::mem::take(&mut self.pending);
        let previous: HashSet<String> = self.replicas.keys().cloned().collect();

        self.replicas.clear();
        self.state_vector = StateVector::new();
        self.clock = 0;

        let mut replay = others;
        replay.extend(pending.into_values());
        replay.extend(remote);
        let mut outcome = self.apply_remote_batch(replay);
        let restamped = self.restamp_own(own, room_clock);
        outcome.applied.extend(restamped.into_iter().map(|op| op.id));

        self.notify_replaced(previous);
        outcome
    }

    /// Apply `own` again with ids above both `room_clock` and everything seen
    fn restamp_own(&mut self, own: Vec<Operation>, room_clock: u64) -> Vec<Operation> {
        self.clock = self.clock.max(room_clock);
        let mut renamed: HashMap<OpId, OpId> = HashMap::new();
        let mut restamped = Vec::with_capacity(own.len());
        for op in own {
            let id = OpId::new(self.clock + 1, self.client_id.clone());
            let payload = op.payload.with_op_ids(&renamed);
            renamed.insert(op.id, id.clone());
            let op = Operation {
                replica: op.replica,
                id,
                payload,
                depends_on: self.state_vector.heads(),
            };
            self.integrate(&op);
            restamped.push(op);
        }
        if !restamped.is_empty() {
            info!(client = %self.client_id, count = restamped.len(), "local operations re-stamped");
            self.rebased = true;
        }
        self.own_ids_confirmed = true;
        restamped
    }

    /// Tell every subscriber of a current or `previous` replica that it was replaced
    fn notify_replaced(&mut self, previous: HashSet<String>) {
        let mut names: Vec<String> = self.replicas.keys().cloned().collect();
        names.extend(previous.into_iter().filter(|n| !self.replicas.contains_key(n)));
        for name in names {
            self.notify(&name, Origin::Remote, Vec::new());
        }
    }

    /// Intents that undo a recorded local operation, computed from current state
    pub fn revert_intents(&self, replica: &str, op: &OpId, revert: &Revert) -> Vec<Intent> {
        self.replicas
            .get(replica)
            .map(|r| r.revert_intents(op, revert, &self.client_id))
            .unwrap_or_default()
    }

    /// Intents that empty every replica
    pub fn clear_intents(&self) -> Vec<(String, Intent)> {
        self.replicas
            .iter()
            .flat_map(|(name, replica)| {
                replica
                    .clear_intents()
                    .into_iter()
                    .map(move |intent| (name.clone(), intent))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{NodeKind, Shape, ShapeKind, ROOT_ID};

    fn insert(index: usize, text: &str) -> Intent {
        Intent::InsertText {
            index,
            text: text.to_string(),
        }
    }

    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_apply_local_emits_operation_with_dependencies() {
        let mut store = ReplicaStore::new("alice");
        let first = store.apply_local("main.rs", insert(0, "fn")).unwrap();
        let second = store.apply_local("main.rs", insert(2, " main")).unwrap();

        assert_eq!(first.id, OpId::new(1, "alice"));
        assert!(first.depends_on.is_empty());
        assert_eq!(second.id, OpId::new(2, "alice"));
        assert!(second.depends_on.contains(&first.id));
        assert_eq!(store.text("main.rs").as_deref(), Some("fn main"));
        assert_eq!(store.history().len(), 2);
    }

    #[test]
    fn test_rejected_intent_emits_nothing() {
        let mut store = ReplicaStore::new("alice");
        let err = store.apply_local("notes", insert(0, "")).unwrap_err();
        assert!(matches!(err, CrdtError::Validation(_)));
        assert!(store.replica("notes").is_none());
        assert_eq!(store.clock(), 0);
        assert!(store.history().is_empty());
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let mut store = ReplicaStore::new("alice");
        store.apply_local("doc", insert(0, "x")).unwrap();
        let err = store
            .apply_local(
                "doc",
                Intent::PutShape {
                    id: "s".into(),
                    shape: Shape::new(ShapeKind::Line, 0.0, 0.0, 1.0, 1.0),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CrdtError::KindMismatch { .. }));
    }

    #[test]
    fn test_convergence_under_any_delivery_order() {
        let mut alice = ReplicaStore::new("alice");
        let mut bob = ReplicaStore::new("bob");
        let mut ops = vec![
            alice.apply_local("doc", insert(0, "hello")).unwrap(),
            alice.apply_local("doc", insert(5, "!")).unwrap(),
        ];
        ops.push(bob.apply_local("doc", insert(0, "hey ")).unwrap());
        ops.push(
            bob.apply_local(
                "tree",
                Intent::CreateNode {
                    node: "n1".into(),
                    parent: ROOT_ID.into(),
                    name: "src".into(),
                    kind: NodeKind::Folder,
                    order_hint: 0.0,
                },
            )
            .unwrap(),
        );

        let mut results = Vec::new();
        for order in permutations(&ops) {
            let mut carol = ReplicaStore::new("carol");
            for op in order {
                carol.apply_remote(op);
            }
            assert_eq!(carol.pending_len(), 0);
            results.push(carol.export());
        }
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let mut alice = ReplicaStore::new("alice");
        let op = alice.apply_local("doc", insert(0, "abc")).unwrap();

        let mut bob = ReplicaStore::new("bob");
        let first = bob.apply_remote(op.clone());
        let again = bob.apply_remote(op);

        assert_eq!(first.applied.len(), 1);
        assert!(again.is_noop());
        assert_eq!(again.duplicates, 1);
        assert_eq!(bob.text("doc").as_deref(), Some("abc"));
        assert_eq!(bob.history().len(), 1);
    }

    #[test]
    fn test_out_of_order_operations_are_buffered() {
        let mut alice = ReplicaStore::new("alice");
        let first = alice.apply_local("doc", insert(0, "a")).unwrap();
        let second = alice.apply_local("doc", insert(1, "b")).unwrap();

        let mut bob = ReplicaStore::new("bob");
        let outcome = bob.apply_remote(second);
        assert_eq!(outcome.buffered, 1);
        assert!(bob.text("doc").is_none());

        let outcome = bob.apply_remote(first);
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(bob.text("doc").as_deref(), Some("ab"));
    }

    #[test]
    fn test_concurrent_ab_cd_converge() {
        let mut one = ReplicaStore::new("client-1");
        let mut two = ReplicaStore::new("client-2");

        // client 2 has already produced one op, so its insert carries clock 2
        let warmup = two
            .apply_local(
                "board",
                Intent::PutShape {
                    id: "s".into(),
                    shape: Shape::new(ShapeKind::Rectangle, 0.0, 0.0, 1.0, 1.0),
                },
            )
            .unwrap();
        let ab = one.apply_local("main.rs", insert(0, "AB")).unwrap();
        let cd = two.apply_local("main.rs", insert(0, "CD")).unwrap();
        assert_eq!(ab.id.clock, 1);
        assert_eq!(cd.id.clock, 2);

        one.apply_remote_batch(vec![warmup, cd]);
        two.apply_remote(ab);

        assert_eq!(one.text("main.rs").as_deref(), Some("ABCD"));
        assert_eq!(two.text("main.rs").as_deref(), Some("ABCD"));
    }

    #[test]
    fn test_delete_wins_and_rename_stays_in_history() {
        let mut one = ReplicaStore::new("client-1");
        let create = one
            .apply_local(
                "tree",
                Intent::CreateNode {
                    node: "docs".into(),
                    parent: ROOT_ID.into(),
                    name: "docs".into(),
                    kind: NodeKind::Folder,
                    order_hint: 0.0,
                },
            )
            .unwrap();
        let mut two = ReplicaStore::new("client-2");
        two.apply_remote(create);

        let rename = one
            .apply_local(
                "tree",
                Intent::RenameNode {
                    node: "docs".into(),
                    name: "documentation".into(),
                },
            )
            .unwrap();
        let delete = two
            .apply_local(
                "tree",
                Intent::DeleteNodes {
                    nodes: vec!["docs".into()],
                },
            )
            .unwrap();

        one.apply_remote(delete);
        two.apply_remote(rename.clone());

        for store in [&one, &two] {
            assert!(store.tree("tree").unwrap().get("docs").is_none());
            assert!(store.history().iter().any(|op| op.id == rename.id));
        }
    }

    #[test]
    fn test_ops_missing_returns_exact_delta() {
        let mut store = ReplicaStore::new("alice");
        for i in 0..5 {
            store.apply_local("doc", insert(i, "x")).unwrap();
        }
        let remote: StateVector = [("alice".to_string(), 2)].into_iter().collect();
        let missing = store.ops_missing(&remote).unwrap();
        let clocks: Vec<u64> = missing.iter().map(|op| op.id.clock).collect();
        assert_eq!(clocks, vec![3, 4, 5]);
        assert!(store.ops_missing(store.state_vector()).unwrap().is_empty());
    }

    #[test]
    fn test_compaction_raises_floor() {
        let mut store = ReplicaStore::new("alice");
        for i in 0..4 {
            store.apply_local("doc", insert(i, "x")).unwrap();
        }
        let horizon: StateVector = [("alice".to_string(), 3)].into_iter().collect();
        assert_eq!(store.compact(&horizon), 3);
        assert_eq!(store.history().len(), 1);

        let behind: StateVector = [("alice".to_string(), 1)].into_iter().collect();
        assert!(store.ops_missing(&behind).is_none());
        assert_eq!(store.ops_missing(&horizon).unwrap().len(), 1);
    }

    #[test]
    fn test_reset_from_keeps_unsent_local_work() {
        let mut server = ReplicaStore::new("server");
        let mut alice = ReplicaStore::new("alice");
        let shared = alice.apply_local("doc", insert(0, "shared")).unwrap();
        server.apply_remote(shared);

        let local = alice.apply_local("doc", insert(6, "!")).unwrap();
        let mut bob = ReplicaStore::new("bob");
        bob.apply_remote_batch(server.history().to_vec());
        server.apply_remote(bob.apply_local("doc", insert(0, ">")).unwrap());

        let carried = alice.reset_from(server.to_state());
        assert_eq!(carried, vec![local]);
        assert_eq!(alice.text("doc").as_deref(), Some(">shared!"));
        assert!(alice.clock() >= 2);
    }

    #[test]
    fn test_pending_buffer_drops_oldest_when_full() {
        let mut alice = ReplicaStore::new("alice");
        let ops: Vec<Operation> = "abcd"
            .chars()
            .enumerate()
            .map(|(i, ch)| alice.apply_local("doc", insert(i, &ch.to_string())).unwrap())
            .collect();

        let mut bob = ReplicaStore::new("bob").with_pending_limit(2);
        let outcome = bob.apply_remote_batch(ops[1..].to_vec());
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.buffered, 2);
        assert_eq!(bob.pending_len(), 2);
        assert!(bob.is_new(&ops[1]));

        // the dropped operation is accepted again when it is resent
        let outcome = bob.apply_remote(ops[0].clone());
        assert_eq!(outcome.applied.len(), 1);
        let outcome = bob.apply_remote(ops[1].clone());
        assert_eq!(outcome.applied.len(), 3);
        assert_eq!(bob.text("doc").as_deref(), Some("abcd"));
        assert_eq!(bob.pending_len(), 0);
    }

    #[test]
    fn test_restarted_client_restamps_clashing_ids() {
        let mut room = ReplicaStore::new("~room");
        let mut before = ReplicaStore::new("alice");
        room.apply_remote_batch(vec![
            before.apply_local("doc", insert(0, "hello")).unwrap(),
            before.apply_local("doc", insert(5, "!")).unwrap(),
        ]);

        // same client id, fresh store, edits made before the first handshake
        let mut alice = ReplicaStore::new("alice");
        let offline = alice.apply_local("doc", insert(0, "X")).unwrap();
        alice.apply_local("doc", insert(1, "Y")).unwrap();
        assert_eq!(offline.id, OpId::new(1, "alice"));

        alice.adopt_room_clock(room.state_vector().get("alice"));
        let request = alice.handshake_vector();
        assert_eq!(request.get("alice"), 0);

        let outcome = alice.apply_remote_batch(room.ops_missing(&request).unwrap());
        assert!(alice.take_rebased());
        assert!(!alice.take_rebased());
        assert_eq!(outcome.applied.len(), 4);
        assert_eq!(alice.state_vector().get("alice"), 4);

        let pushed = alice.ops_missing(room.state_vector()).unwrap();
        let clocks: Vec<u64> = pushed.iter().map(|op| op.id.clock).collect();
        assert_eq!(clocks, vec![3, 4]);
        room.apply_remote_batch(pushed);

        assert_eq!(room.export(), alice.export());
        let text = room.text("doc").unwrap();
        assert!(text.contains("XY"));
        assert!(text.contains("hello!"));

        let next = alice.apply_local("doc", insert(0, ">")).unwrap();
        assert_eq!(next.id, OpId::new(5, "alice"));
    }

    #[test]
    fn test_restamp_also_applies_to_snapshot_reset() {
        let mut room = ReplicaStore::new("~room");
        let mut before = ReplicaStore::new("alice");
        room.apply_remote(before.apply_local("doc", insert(0, "old")).unwrap());

        let mut alice = ReplicaStore::new("alice");
        alice.apply_local("doc", insert(0, "new")).unwrap();
        alice.adopt_room_clock(1);

        let carried = alice.reset_from(room.to_state());
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].id, OpId::new(2, "alice"));
        assert!(alice.take_rebased());

        room.apply_remote_batch(carried);
        assert_eq!(room.export(), alice.export());
        assert_eq!(room.text("doc").unwrap().len(), 6);
    }

    #[test]
    fn test_room_clock_without_clash_only_advances_clock() {
        let mut alice = ReplicaStore::new("alice");
        alice.adopt_room_clock(7);
        assert_eq!(alice.handshake_vector(), StateVector::new());
        let op = alice.apply_local("doc", insert(0, "x")).unwrap();
        assert_eq!(op.id, OpId::new(8, "alice"));
        assert!(!alice.take_rebased());

        // once ids are confirmed a later handshake never rebases
        alice.adopt_room_clock(20);
        assert_eq!(alice.handshake_vector().get("alice"), 8);
        assert_eq!(alice.clock(), 20);
    }

    #[test]
    fn test_document_state_survives_encoding() {
        let mut store = ReplicaStore::new("alice");
        store.apply_local("doc", insert(0, "persist me")).unwrap();
        store
            .apply_local(
                "board",
                Intent::PutShape {
                    id: "s".into(),
                    shape: Shape::new(ShapeKind::Arrow, 1.0, 2.0, 3.0, 4.0)
                        .with_points(vec![(0.0, 0.0), (3.0, 4.0)]),
                },
            )
            .unwrap();

        let bytes = store.to_state().encode().unwrap();
        let restored = ReplicaStore::from_state("bob", DocumentState::decode(&bytes).unwrap());
        assert_eq!(restored.export(), store.export());
        assert_eq!(restored.state_vector(), store.state_vector());
    }

    #[tokio::test]
    async fn test_subscription_receives_events_and_unsubscribes_on_drop() {
        let mut store = ReplicaStore::new("alice");
        let mut sub = store.subscribe("doc");
        let op = store.apply_local("doc", insert(0, "x")).unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.origin, Origin::Local);
        assert_eq!(event.ops, vec![op.id]);

        drop(sub);
        store.apply_local("doc", insert(1, "y")).unwrap();
        assert_eq!(store.subscriber_count("doc"), 0);
    }

    #[test]
    fn test_clear_intents_cover_every_replica() {
        let mut store = ReplicaStore::new("alice");
        store.apply_local("doc", insert(0, "abc")).unwrap();
        store
            .apply_local(
                "tree",
                Intent::CreateNode {
                    node: "a".into(),
                    parent: ROOT_ID.into(),
                    name: "a".into(),
                    kind: NodeKind::File,
                    order_hint: 0.0,
                },
            )
            .unwrap();
        for (replica, intent) in store.clear_intents() {
            store.apply_local(&replica, intent).unwrap();
        }
        assert!(store.replica_sizes().values().all(|size| *size == 0));
    }
}
