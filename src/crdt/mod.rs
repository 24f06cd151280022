//! Operation-based CRDT replicas for room documents.
//!
//! Every mutation is an [`Operation`] identified by an [`OpId`] of
//! `(clock, client)`. Clocks are Lamport timestamps: a replica advances its
//! clock past every clock it observes, so per-client clocks are strictly
//! increasing and last-writer-wins decisions follow causality rather than
//! wall time.
//!
//! This module provides:
//! - Text, tree and shape-set replicas
//! - The per-room replica store with causal delivery and resync history
//! - Local-only undo/redo

pub mod shapes;
pub mod store;
pub mod text;
pub mod tree;
pub mod undo;

pub use shapes::{Shape, ShapeKind, ShapeOp, ShapeSetReplica, ShapeView};
pub use store::{
    Applied, ApplyOutcome, DocumentState, ExportedDocument, Origin, Replica, ReplicaEvent,
    ReplicaStore, ReplicaValue, Subscription,
};
pub use text::{CharId, TextOp, TextReplica};
pub use tree::{NodeKind, TreeNodeView, TreeOp, TreeReplica, ROOT_ID};
pub use undo::UndoManager;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Stable identifier of a client, supplied by the caller
pub type ClientId = String;

/// Identifier of a tree node
pub type NodeId = String;

/// Result type for replica operations
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Unique operation identifier. Ordered by clock first, then client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub clock: u64,
    pub client: ClientId,
}

impl OpId {
    pub fn new(clock: u64, client: impl Into<ClientId>) -> Self {
        Self {
            clock,
            client: client.into(),
        }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.clock, self.client)
    }
}

/// Highest applied clock per client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ClientId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock seen from `client` (0 if none)
    pub fn get(&self, client: &str) -> u64 {
        self.0.get(client).copied().unwrap_or(0)
    }

    /// Whether the operation `id` is covered by this vector
    pub fn contains(&self, id: &OpId) -> bool {
        self.get(&id.client) >= id.clock
    }

    /// Record that `id` has been applied
    pub fn observe(&mut self, id: &OpId) {
        let entry = self.0.entry(id.client.clone()).or_insert(0);
        if id.clock > *entry {
            *entry = id.clock;
        }
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &StateVector) {
        for (client, clock) in &other.0 {
            let entry = self.0.entry(client.clone()).or_insert(0);
            if *clock > *entry {
                *entry = *clock;
            }
        }
    }

    /// Pointwise minimum over the union of both key sets (missing entries count as 0)
    pub fn meet(&self, other: &StateVector) -> StateVector {
        let mut out = BTreeMap::new();
        for (client, clock) in &self.0 {
            let min = (*clock).min(other.get(client));
            if min > 0 {
                out.insert(client.clone(), min);
            }
        }
        StateVector(out)
    }

    /// Whether every entry of `other` is covered by this vector
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(client, clock)| self.get(client) >= *clock)
    }

    /// This vector with `client`'s entry dropped
    pub fn without(&self, client: &str) -> StateVector {
        let mut out = self.0.clone();
        out.remove(client);
        StateVector(out)
    }

    /// Latest operation id per client, used as the dependency set of new operations
    pub fn heads(&self) -> BTreeSet<OpId> {
        self.0
            .iter()
            .filter(|(_, clock)| **clock > 0)
            .map(|(client, clock)| OpId::new(*clock, client.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|clock| *clock == 0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(ClientId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ClientId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (client, clock) in iter {
            sv.observe(&OpId::new(clock, client));
        }
        sv
    }
}

/// The kind of data a replica holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaKind {
    Text,
    Tree,
    Shapes,
}

/// Replica-specific operation payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Text(TextOp),
    Tree(TreeOp),
    Shapes(ShapeOp),
}

impl Payload {
    pub fn kind(&self) -> ReplicaKind {
        match self {
            Payload::Text(_) => ReplicaKind::Text,
            Payload::Tree(_) => ReplicaKind::Tree,
            Payload::Shapes(_) => ReplicaKind::Shapes,
        }
    }

    /// The same payload with references to renamed operations rewritten
    pub(crate) fn with_op_ids(&self, renamed: &HashMap<OpId, OpId>) -> Payload {
        match self {
            Payload::Text(op) => Payload::Text(op.with_op_ids(renamed)),
            other => other.clone(),
        }
    }
}

/// An immutable CRDT mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Name of the replica this operation targets
    pub replica: String,
    pub id: OpId,
    pub payload: Payload,
    /// Operations that must be applied before this one
    pub depends_on: BTreeSet<OpId>,
}

/// High-level local edit, converted into an [`Operation`] by the store
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Insert text at a visible character index
    InsertText { index: usize, text: String },
    /// Delete `len` visible characters starting at `index`
    DeleteText { index: usize, len: usize },
    /// Insert text right after a character (or at the start when `None`)
    InsertAfter {
        origin: Option<CharId>,
        text: String,
    },
    /// Delete specific characters by id
    DeleteChars { targets: Vec<CharId> },
    CreateNode {
        node: NodeId,
        parent: NodeId,
        name: String,
        kind: NodeKind,
        order_hint: f64,
    },
    RenameNode { node: NodeId, name: String },
    /// Reparent a node; the order hint defaults to the end of the new parent
    MoveNode {
        node: NodeId,
        parent: NodeId,
        order_hint: Option<f64>,
    },
    /// Tombstone a set of nodes in one operation
    DeleteNodes { nodes: Vec<NodeId> },
    PutShape { id: String, shape: Shape },
    RemoveShape { id: String },
}

impl Intent {
    pub fn kind(&self) -> ReplicaKind {
        match self {
            Intent::InsertText { .. }
            | Intent::DeleteText { .. }
            | Intent::InsertAfter { .. }
            | Intent::DeleteChars { .. } => ReplicaKind::Text,
            Intent::CreateNode { .. }
            | Intent::RenameNode { .. }
            | Intent::MoveNode { .. }
            | Intent::DeleteNodes { .. } => ReplicaKind::Tree,
            Intent::PutShape { .. } | Intent::RemoveShape { .. } => ReplicaKind::Shapes,
        }
    }
}

/// What a local operation replaced, kept by the undo manager
#[derive(Debug, Clone, PartialEq)]
pub enum Revert {
    Text(text::TextRevert),
    Tree(tree::TreeRevert),
    Shapes(shapes::ShapeRevert),
}

/// Last-writer-wins register keyed on the writing operation's id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Lww<T> {
    pub value: T,
    pub stamp: OpId,
}

impl<T> Lww<T> {
    pub fn new(value: T, stamp: OpId) -> Self {
        Self { value, stamp }
    }

    /// Write `value` if `stamp` is newer; returns the replaced value
    pub fn set(&mut self, value: T, stamp: &OpId) -> Option<T> {
        if *stamp > self.stamp {
            self.stamp = stamp.clone();
            Some(std::mem::replace(&mut self.value, value))
        } else {
            None
        }
    }
}

/// Errors that can occur when preparing or applying operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CrdtError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Replica {name} holds {actual:?} data, not {expected:?}")]
    KindMismatch {
        name: String,
        expected: ReplicaKind,
        actual: ReplicaKind,
    },
}
