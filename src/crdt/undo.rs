//! Local-only undo/redo.
//!
//! Only operations produced by the local client are recorded. Inverses are
//! computed when undo runs, against the current state, so content another
//! client has since deleted or overwritten is left alone.

use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Applied, ClientId, OpId, Operation, ReplicaStore, Revert};

/// Edits closer together than this are undone as one step
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone)]
struct UndoEntry {
    replica: String,
    op: OpId,
    revert: Revert,
}

#[derive(Debug, Clone)]
struct UndoBatch {
    entries: Vec<UndoEntry>,
    last_at: Instant,
}

#[derive(Debug)]
pub struct UndoManager {
    local_client: ClientId,
    scope: HashSet<String>,
    capture_timeout: Duration,
    undo_stack: Vec<UndoBatch>,
    redo_stack: Vec<UndoBatch>,
    capturing: bool,
}

impl UndoManager {
    pub fn new(local_client: impl Into<ClientId>, capture_timeout: Duration) -> Self {
        Self {
            local_client: local_client.into(),
            scope: HashSet::new(),
            capture_timeout,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            capturing: false,
        }
    }

    /// Start recording local edits to `replica`
    pub fn recordable_scope(&mut self, replica: impl Into<String>) {
        self.scope.insert(replica.into());
    }

    pub fn in_scope(&self, replica: &str) -> bool {
        self.scope.contains(replica)
    }

    pub fn record(&mut self, applied: &Applied) {
        self.record_at(applied, Instant::now());
    }

    pub(crate) fn record_at(&mut self, applied: &Applied, now: Instant) {
        let Some(revert) = applied.revert.clone() else {
            return;
        };
        if applied.op.id.client != self.local_client || !self.in_scope(&applied.op.replica) {
            return;
        }

        self.redo_stack.clear();
        let entry = UndoEntry {
            replica: applied.op.replica.clone(),
            op: applied.op.id.clone(),
            revert,
        };
        let timeout = self.capture_timeout;
        match self.undo_stack.last_mut() {
            Some(batch)
                if self.capturing && now.saturating_duration_since(batch.last_at) <= timeout =>
            {
                batch.entries.push(entry);
                batch.last_at = now;
            }
            _ => {
                self.undo_stack.push(UndoBatch {
                    entries: vec![entry],
                    last_at: now,
                });
                if self.undo_stack.len() > MAX_DEPTH {
                    self.undo_stack.remove(0);
                }
            }
        }
        self.capturing = true;
    }

    /// Close the current batch; the next recorded edit starts a new one
    pub fn stop_capturing(&mut self) {
        self.capturing = false;
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Revert the latest local batch. Returns the new operations to broadcast.
    pub fn undo(&mut self, store: &mut ReplicaStore) -> Vec<Operation> {
        let Some(batch) = self.undo_stack.pop() else {
            return Vec::new();
        };
        let (ops, inverse) = Self::invert(&batch, store);
        if !inverse.entries.is_empty() {
            self.redo_stack.push(inverse);
        }
        self.capturing = false;
        ops
    }

    pub fn redo(&mut self, store: &mut ReplicaStore) -> Vec<Operation> {
        let Some(batch) = self.redo_stack.pop() else {
            return Vec::new();
        };
        let (ops, inverse) = Self::invert(&batch, store);
        if !inverse.entries.is_empty() {
            self.undo_stack.push(inverse);
        }
        self.capturing = false;
        ops
    }

    fn invert(batch: &UndoBatch, store: &mut ReplicaStore) -> (Vec<Operation>, UndoBatch) {
        let mut ops = Vec::new();
        let mut entries = Vec::new();
        for entry in batch.entries.iter().rev() {
            for intent in store.revert_intents(&entry.replica, &entry.op, &entry.revert) {
                match store.apply_local_tracked(&entry.replica, intent) {
                    Ok(applied) => {
                        if let Some(revert) = applied.revert {
                            entries.push(UndoEntry {
                                replica: entry.replica.clone(),
                                op: applied.op.id.clone(),
                                revert,
                            });
                        }
                        ops.push(applied.op);
                    }
                    Err(err) => {
                        debug!(replica = %entry.replica, error = %err, "skipping inverse that no longer applies")
                    }
                }
            }
        }
        (
            ops,
            UndoBatch {
                entries,
                last_at: Instant::now(),
            },
        )
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.capturing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Intent, NodeKind, ROOT_ID};

    fn insert(index: usize, text: &str) -> Intent {
        Intent::InsertText {
            index,
            text: text.to_string(),
        }
    }

    fn edit(
        store: &mut ReplicaStore,
        undo: &mut UndoManager,
        replica: &str,
        intent: Intent,
    ) -> Operation {
        let applied = store.apply_local_tracked(replica, intent).unwrap();
        undo.record(&applied);
        undo.stop_capturing();
        applied.op
    }

    #[test]
    fn test_undo_and_redo_local_insert() {
        let mut store = ReplicaStore::new("alice");
        let mut undo = UndoManager::new("alice", DEFAULT_CAPTURE_TIMEOUT);
        undo.recordable_scope("doc");

        edit(&mut store, &mut undo, "doc", insert(0, "hello"));
        edit(&mut store, &mut undo, "doc", insert(5, " world"));

        let ops = undo.undo(&mut store);
        assert_eq!(ops.len(), 1);
        assert_eq!(store.text("doc").as_deref(), Some("hello"));

        undo.redo(&mut store);
        assert_eq!(store.text("doc").as_deref(), Some("hello world"));
        assert!(undo.can_undo());
        assert!(!undo.can_redo());
    }

    #[test]
    fn test_edits_within_capture_timeout_coalesce() {
        let mut store = ReplicaStore::new("alice");
        let mut undo = UndoManager::new("alice", Duration::from_millis(500));
        undo.recordable_scope("doc");

        let start = Instant::now();
        let a = store.apply_local_tracked("doc", insert(0, "a")).unwrap();
        undo.record_at(&a, start);
        let b = store.apply_local_tracked("doc", insert(1, "b")).unwrap();
        undo.record_at(&b, start + Duration::from_millis(100));
        let c = store.apply_local_tracked("doc", insert(2, "c")).unwrap();
        undo.record_at(&c, start + Duration::from_secs(2));

        assert_eq!(undo.undo_depth(), 2);
        undo.undo(&mut store);
        assert_eq!(store.text("doc").as_deref(), Some("ab"));
        undo.undo(&mut store);
        assert_eq!(store.text("doc").as_deref(), Some(""));
    }

    #[test]
    fn test_out_of_scope_and_remote_ops_are_not_recorded() {
        let mut store = ReplicaStore::new("alice");
        let mut undo = UndoManager::new("alice", DEFAULT_CAPTURE_TIMEOUT);
        undo.recordable_scope("doc");

        edit(&mut store, &mut undo, "scratch", insert(0, "x"));
        assert!(!undo.can_undo());

        let mut bob = ReplicaStore::new("bob");
        let remote = bob.apply_local_tracked("doc", insert(0, "b")).unwrap();
        undo.record(&remote);
        assert!(!undo.can_undo());
    }

    #[test]
    fn test_undo_leaves_other_clients_content() {
        let mut alice = ReplicaStore::new("alice");
        let mut bob = ReplicaStore::new("bob");
        let mut undo = UndoManager::new("alice", DEFAULT_CAPTURE_TIMEOUT);
        undo.recordable_scope("doc");

        let hello = edit(&mut alice, &mut undo, "doc", insert(0, "Hello"));
        bob.apply_remote(hello);
        let world = bob.apply_local("doc", insert(5, " World")).unwrap();
        alice.apply_remote(world);

        // repeated undo must stop at alice's own edits
        let mut undo_ops = undo.undo(&mut alice);
        undo_ops.extend(undo.undo(&mut alice));
        assert_eq!(alice.text("doc").as_deref(), Some(" World"));

        bob.apply_remote_batch(undo_ops);
        assert_eq!(bob.text("doc").as_deref(), Some(" World"));
    }

    #[test]
    fn test_undo_skips_text_deleted_by_another_client() {
        let mut alice = ReplicaStore::new("alice");
        let mut bob = ReplicaStore::new("bob");
        let mut undo = UndoManager::new("alice", DEFAULT_CAPTURE_TIMEOUT);
        undo.recordable_scope("doc");

        let seed = alice.apply_local("doc", insert(0, "abc")).unwrap();
        bob.apply_remote(seed);

        edit(
            &mut alice,
            &mut undo,
            "doc",
            Intent::DeleteText { index: 1, len: 1 },
        );
        let theirs = bob
            .apply_local("doc", Intent::DeleteText { index: 1, len: 1 })
            .unwrap();
        alice.apply_remote(theirs);

        let ops = undo.undo(&mut alice);
        assert!(ops.is_empty());
        assert_eq!(alice.text("doc").as_deref(), Some("ac"));
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut store = ReplicaStore::new("alice");
        let mut undo = UndoManager::new("alice", DEFAULT_CAPTURE_TIMEOUT);
        undo.recordable_scope("doc");

        edit(&mut store, &mut undo, "doc", insert(0, "a"));
        undo.undo(&mut store);
        assert!(undo.can_redo());
        edit(&mut store, &mut undo, "doc", insert(0, "b"));
        assert!(!undo.can_redo());
    }

    #[test]
    fn test_tree_delete_is_not_undone() {
        let mut store = ReplicaStore::new("alice");
        let mut undo = UndoManager::new("alice", DEFAULT_CAPTURE_TIMEOUT);
        undo.recordable_scope("tree");

        edit(
            &mut store,
            &mut undo,
            "tree",
            Intent::CreateNode {
                node: "a".into(),
                parent: ROOT_ID.into(),
                name: "a.txt".into(),
                kind: NodeKind::File,
                order_hint: 0.0,
            },
        );
        edit(
            &mut store,
            &mut undo,
            "tree",
            Intent::DeleteNodes {
                nodes: vec!["a".into()],
            },
        );

        // only the create was recorded; undoing it finds nothing left to delete
        assert_eq!(undo.undo_depth(), 1);
        assert!(undo.undo(&mut store).is_empty());
        assert!(store.tree("tree").unwrap().is_deleted("a"));
    }
}
