//! Movable tree CRDT backing the shared file tree.
//!
//! Node names are last-writer-wins registers. Placements (create and move)
//! are replayed in operation id order; a placement that would put a node
//! under its own descendant is skipped, so every replica that has seen the
//! same operations ends up with the same acyclic tree. Deletes are permanent
//! tombstones and win over concurrent renames and moves. Live children of a
//! deleted folder show up under the nearest live ancestor.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::{CrdtError, CrdtResult, Intent, Lww, NodeId, OpId};

/// Id of the implicit root folder every tree starts with
pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// Tree replica operation payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeOp {
    Create {
        node: NodeId,
        parent: NodeId,
        name: String,
        kind: NodeKind,
        order_hint: f64,
    },
    Rename {
        node: NodeId,
        name: String,
    },
    Move {
        node: NodeId,
        parent: NodeId,
        order_hint: f64,
    },
    Delete {
        nodes: Vec<NodeId>,
    },
}

/// What a local tree operation replaced
#[derive(Debug, Clone, PartialEq)]
pub enum TreeRevert {
    Created {
        node: NodeId,
    },
    Renamed {
        node: NodeId,
        previous: String,
    },
    Moved {
        node: NodeId,
        previous_parent: Option<NodeId>,
        previous_hint: f64,
    },
}

/// Snapshot view of a live node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNodeView {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub parent_id: Option<NodeId>,
    pub order_hint: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Node {
    kind: NodeKind,
    name: Lww<String>,
    parent: Option<NodeId>,
    order_hint: f64,
    /// Placement currently in effect
    placed_by: Option<OpId>,
    deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Placement {
    node: NodeId,
    parent: NodeId,
    order_hint: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeReplica {
    nodes: HashMap<NodeId, Node>,
    placements: BTreeMap<OpId, Placement>,
}

impl Default for TreeReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeReplica {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID.to_string(),
            Node {
                kind: NodeKind::Folder,
                name: Lww::new(String::new(), OpId::new(0, "")),
                parent: None,
                order_hint: 0.0,
                placed_by: None,
                deleted: false,
            },
        );
        Self {
            nodes,
            placements: BTreeMap::new(),
        }
    }

    /// Whether `id` names a live node (the root always is)
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.get(id).map_or(false, |node| !node.deleted)
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.nodes.get(id).map_or(false, |node| node.deleted)
    }

    pub fn kind(&self, id: &str) -> Option<NodeKind> {
        self.nodes
            .get(id)
            .filter(|node| !node.deleted)
            .map(|node| node.kind)
    }

    pub fn name(&self, id: &str) -> Option<&str> {
        self.nodes
            .get(id)
            .filter(|node| !node.deleted)
            .map(|node| node.name.value.as_str())
    }

    /// Number of live nodes, not counting the root
    pub fn len(&self) -> usize {
        self.nodes
            .iter()
            .filter(|(id, node)| !node.deleted && id.as_str() != ROOT_ID)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<TreeNodeView> {
        if id == ROOT_ID {
            return None;
        }
        let node = self.nodes.get(id).filter(|node| !node.deleted)?;
        Some(TreeNodeView {
            id: id.to_string(),
            name: node.name.value.clone(),
            kind: node.kind,
            parent_id: self.parent_of(id),
            order_hint: node.order_hint,
        })
    }

    /// Parent as displayed: the nearest live ancestor
    pub fn parent_of(&self, id: &str) -> Option<NodeId> {
        if id == ROOT_ID {
            return None;
        }
        let mut current = self.nodes.get(id)?.parent.clone();
        let mut steps = 0;
        while let Some(parent) = current {
            match self.nodes.get(&parent) {
                Some(node) if !node.deleted => return Some(parent),
                Some(node) => current = node.parent.clone(),
                None => break,
            }
            steps += 1;
            if steps > self.nodes.len() {
                break;
            }
        }
        Some(ROOT_ID.to_string())
    }

    /// Live children of `id` in display order
    pub fn children(&self, id: &str) -> Vec<TreeNodeView> {
        self.child_index()
            .remove(id)
            .unwrap_or_default()
            .iter()
            .filter_map(|child| self.get(child))
            .collect()
    }

    /// Live descendants of `id` in depth-first order, excluding `id`
    pub fn descendants(&self, id: &str) -> Vec<NodeId> {
        let index = self.child_index();
        let mut out = Vec::new();
        let mut stack: Vec<&NodeId> = index
            .get(id)
            .map(|children| children.iter().rev().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            out.push(next.clone());
            if let Some(children) = index.get(next) {
                stack.extend(children.iter().rev());
            }
        }
        out
    }

    /// All live nodes, depth first from the root
    pub fn nodes(&self) -> Vec<TreeNodeView> {
        self.descendants(ROOT_ID)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Whether placing `node` under `new_parent` would close a cycle
    pub fn would_cycle(&self, node: &str, new_parent: &str) -> bool {
        let mut current = Some(new_parent.to_string());
        let mut steps = 0;
        while let Some(id) = current {
            if id == node {
                return true;
            }
            steps += 1;
            if steps > self.nodes.len() {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent.clone());
        }
        false
    }

    fn child_index(&self) -> HashMap<NodeId, Vec<NodeId>> {
        let mut grouped: HashMap<NodeId, Vec<(f64, &str, &NodeId)>> = HashMap::new();
        for (id, node) in &self.nodes {
            if id == ROOT_ID || node.deleted {
                continue;
            }
            if let Some(parent) = self.parent_of(id) {
                grouped
                    .entry(parent)
                    .or_default()
                    .push((node.order_hint, node.name.value.as_str(), id));
            }
        }
        grouped
            .into_iter()
            .map(|(parent, mut children)| {
                children.sort_by(|a, b| {
                    a.0.total_cmp(&b.0)
                        .then_with(|| a.1.cmp(b.1))
                        .then_with(|| a.2.cmp(b.2))
                });
                let ids = children.into_iter().map(|(_, _, id)| id.clone()).collect();
                (parent, ids)
            })
            .collect()
    }

    fn next_order_hint(&self, parent: &str) -> f64 {
        self.children(parent)
            .iter()
            .map(|child| child.order_hint)
            .fold(0.0_f64, f64::max)
            + 1.0
    }

    fn require_live(&self, id: &str) -> CrdtResult<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(CrdtError::InvalidOperation(format!("node not found: {}", id)))
        }
    }

    fn require_folder(&self, id: &str) -> CrdtResult<()> {
        self.require_live(id)?;
        match self.kind(id) {
            Some(NodeKind::Folder) => Ok(()),
            _ => Err(CrdtError::InvalidOperation(format!(
                "{} is not a folder",
                id
            ))),
        }
    }

    pub(crate) fn prepare(&self, intent: &Intent) -> CrdtResult<TreeOp> {
        match intent {
            Intent::CreateNode {
                node,
                parent,
                name,
                kind,
                order_hint,
            } => {
                if self.nodes.contains_key(node) {
                    return Err(CrdtError::InvalidOperation(format!(
                        "node {} already exists",
                        node
                    )));
                }
                if !order_hint.is_finite() {
                    return Err(CrdtError::Validation("order hint must be finite".into()));
                }
                self.require_folder(parent)?;
                Ok(TreeOp::Create {
                    node: node.clone(),
                    parent: parent.clone(),
                    name: name.clone(),
                    kind: *kind,
                    order_hint: *order_hint,
                })
            }
            Intent::RenameNode { node, name } => {
                if node == ROOT_ID {
                    return Err(CrdtError::InvalidOperation(
                        "the root node cannot be renamed".into(),
                    ));
                }
                self.require_live(node)?;
                Ok(TreeOp::Rename {
                    node: node.clone(),
                    name: name.clone(),
                })
            }
            Intent::MoveNode {
                node,
                parent,
                order_hint,
            } => {
                if node == ROOT_ID {
                    return Err(CrdtError::InvalidOperation(
                        "the root node cannot be moved".into(),
                    ));
                }
                self.require_live(node)?;
                self.require_folder(parent)?;
                if self.would_cycle(node, parent) {
                    return Err(CrdtError::InvalidOperation(format!(
                        "moving {} under {} would create a cycle",
                        node, parent
                    )));
                }
                let order_hint = match order_hint {
                    Some(hint) if !hint.is_finite() => {
                        return Err(CrdtError::Validation("order hint must be finite".into()))
                    }
                    Some(hint) => *hint,
                    None => self.next_order_hint(parent),
                };
                Ok(TreeOp::Move {
                    node: node.clone(),
                    parent: parent.clone(),
                    order_hint,
                })
            }
            Intent::DeleteNodes { nodes } => {
                if nodes.is_empty() {
                    return Err(CrdtError::Validation("nothing to delete".into()));
                }
                for node in nodes {
                    if node == ROOT_ID {
                        return Err(CrdtError::InvalidOperation(
                            "the root node cannot be deleted".into(),
                        ));
                    }
                    self.require_live(node)?;
                }
                Ok(TreeOp::Delete {
                    nodes: nodes.clone(),
                })
            }
            other => Err(CrdtError::InvalidOperation(format!(
                "{:?} intent cannot target a tree replica",
                other.kind()
            ))),
        }
    }

    pub(crate) fn apply(&mut self, id: &OpId, op: &TreeOp) -> Option<TreeRevert> {
        match op {
            TreeOp::Create {
                node,
                parent,
                name,
                kind,
                order_hint,
            } => {
                if self.nodes.contains_key(node) {
                    return None;
                }
                self.nodes.insert(
                    node.clone(),
                    Node {
                        kind: *kind,
                        name: Lww::new(name.clone(), id.clone()),
                        parent: None,
                        order_hint: *order_hint,
                        placed_by: None,
                        deleted: false,
                    },
                );
                self.placements.insert(
                    id.clone(),
                    Placement {
                        node: node.clone(),
                        parent: parent.clone(),
                        order_hint: *order_hint,
                    },
                );
                self.place(id);
                Some(TreeRevert::Created { node: node.clone() })
            }
            TreeOp::Rename { node, name } => {
                if node == ROOT_ID {
                    return None;
                }
                let entry = self.nodes.get_mut(node)?;
                entry
                    .name
                    .set(name.clone(), id)
                    .map(|previous| TreeRevert::Renamed {
                        node: node.clone(),
                        previous,
                    })
            }
            TreeOp::Move {
                node,
                parent,
                order_hint,
            } => {
                if node == ROOT_ID {
                    return None;
                }
                let (previous_parent, previous_hint) = {
                    let entry = self.nodes.get(node)?;
                    (entry.parent.clone(), entry.order_hint)
                };
                self.placements.insert(
                    id.clone(),
                    Placement {
                        node: node.clone(),
                        parent: parent.clone(),
                        order_hint: *order_hint,
                    },
                );
                self.place(id);
                let effective = self
                    .nodes
                    .get(node)
                    .map_or(false, |entry| entry.placed_by.as_ref() == Some(id));
                effective.then(|| TreeRevert::Moved {
                    node: node.clone(),
                    previous_parent,
                    previous_hint,
                })
            }
            TreeOp::Delete { nodes } => {
                for node in nodes {
                    if node == ROOT_ID {
                        continue;
                    }
                    if let Some(entry) = self.nodes.get_mut(node) {
                        entry.deleted = true;
                    }
                }
                None
            }
        }
    }

    fn place(&mut self, id: &OpId) {
        let is_latest = self.placements.keys().next_back() == Some(id);
        if is_latest {
            if let Some(placement) = self.placements.get(id).cloned() {
                self.apply_placement(id, &placement);
            }
        } else {
            self.replay_placements();
        }
    }

    fn replay_placements(&mut self) {
        for (id, node) in self.nodes.iter_mut() {
            if id != ROOT_ID {
                node.parent = None;
                node.placed_by = None;
            }
        }
        let placements: Vec<(OpId, Placement)> = self
            .placements
            .iter()
            .map(|(id, placement)| (id.clone(), placement.clone()))
            .collect();
        for (id, placement) in &placements {
            self.apply_placement(id, placement);
        }
    }

    fn apply_placement(&mut self, id: &OpId, placement: &Placement) {
        if placement.node == ROOT_ID
            || !self.nodes.contains_key(&placement.parent)
            || self.would_cycle(&placement.node, &placement.parent)
        {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&placement.node) {
            node.parent = Some(placement.parent.clone());
            node.order_hint = placement.order_hint;
            node.placed_by = Some(id.clone());
        }
    }

    pub(crate) fn revert_intents(&self, op: &OpId, revert: &TreeRevert) -> Vec<Intent> {
        match revert {
            TreeRevert::Created { node } => {
                if !self.contains(node) {
                    return Vec::new();
                }
                let mut nodes = vec![node.clone()];
                nodes.extend(self.descendants(node));
                vec![Intent::DeleteNodes { nodes }]
            }
            TreeRevert::Renamed { node, previous } => match self.nodes.get(node) {
                Some(entry) if !entry.deleted && entry.name.stamp == *op => {
                    vec![Intent::RenameNode {
                        node: node.clone(),
                        name: previous.clone(),
                    }]
                }
                _ => Vec::new(),
            },
            TreeRevert::Moved {
                node,
                previous_parent,
                previous_hint,
            } => {
                let still_ours = self
                    .nodes
                    .get(node)
                    .map_or(false, |entry| {
                        !entry.deleted && entry.placed_by.as_ref() == Some(op)
                    });
                match previous_parent {
                    Some(parent)
                        if still_ours
                            && self.kind(parent) == Some(NodeKind::Folder)
                            && !self.would_cycle(node, parent) =>
                    {
                        vec![Intent::MoveNode {
                            node: node.clone(),
                            parent: parent.clone(),
                            order_hint: Some(*previous_hint),
                        }]
                    }
                    _ => Vec::new(),
                }
            }
        }
    }

    pub(crate) fn clear_intents(&self) -> Vec<Intent> {
        let nodes = self.descendants(ROOT_ID);
        if nodes.is_empty() {
            Vec::new()
        } else {
            vec![Intent::DeleteNodes { nodes }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tree: &mut TreeReplica, clock: u64, client: &str, intent: Intent) -> TreeOp {
        let op = tree.prepare(&intent).unwrap();
        tree.apply(&OpId::new(clock, client), &op);
        op
    }

    fn folder(node: &str, parent: &str) -> Intent {
        Intent::CreateNode {
            node: node.into(),
            parent: parent.into(),
            name: node.into(),
            kind: NodeKind::Folder,
            order_hint: 0.0,
        }
    }

    fn move_to(node: &str, parent: &str) -> Intent {
        Intent::MoveNode {
            node: node.into(),
            parent: parent.into(),
            order_hint: None,
        }
    }

    #[test]
    fn test_create_and_list_in_order() {
        let mut tree = TreeReplica::new();
        run(&mut tree, 1, "a", folder("src", ROOT_ID));
        run(
            &mut tree,
            2,
            "a",
            Intent::CreateNode {
                node: "main".into(),
                parent: "src".into(),
                name: "main.rs".into(),
                kind: NodeKind::File,
                order_hint: 1.0,
            },
        );
        run(
            &mut tree,
            3,
            "a",
            Intent::CreateNode {
                node: "lib".into(),
                parent: "src".into(),
                name: "lib.rs".into(),
                kind: NodeKind::File,
                order_hint: 0.5,
            },
        );

        let names: Vec<String> = tree.nodes().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["src", "lib.rs", "main.rs"]);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.parent_of("main").as_deref(), Some("src"));
    }

    #[test]
    fn test_prepare_rejects_cycles_and_files_as_parents() {
        let mut tree = TreeReplica::new();
        run(&mut tree, 1, "a", folder("x", ROOT_ID));
        run(&mut tree, 2, "a", folder("y", "x"));
        run(
            &mut tree,
            3,
            "a",
            Intent::CreateNode {
                node: "f".into(),
                parent: "y".into(),
                name: "f.txt".into(),
                kind: NodeKind::File,
                order_hint: 0.0,
            },
        );

        assert!(matches!(
            tree.prepare(&move_to("x", "y")),
            Err(CrdtError::InvalidOperation(_))
        ));
        assert!(matches!(
            tree.prepare(&move_to("y", "f")),
            Err(CrdtError::InvalidOperation(_))
        ));
        assert!(matches!(
            tree.prepare(&Intent::DeleteNodes {
                nodes: vec![ROOT_ID.into()]
            }),
            Err(CrdtError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_concurrent_cross_moves_stay_acyclic() {
        let mut left = TreeReplica::new();
        run(&mut left, 1, "c1", folder("a", ROOT_ID));
        run(&mut left, 2, "c1", folder("b", ROOT_ID));
        let mut right = left.clone();

        // a -> b on one side, b -> a on the other
        let m1 = run(&mut left, 3, "c1", move_to("a", "b"));
        let m2 = run(&mut right, 3, "c2", move_to("b", "a"));

        left.apply(&OpId::new(3, "c2"), &m2);
        right.apply(&OpId::new(3, "c1"), &m1);

        assert_eq!(left.nodes(), right.nodes());
        assert_eq!(left.parent_of("a").as_deref(), Some("b"));
        assert_eq!(left.parent_of("b").as_deref(), Some(ROOT_ID));
    }

    #[test]
    fn test_out_of_order_placement_replays() {
        let mut source = TreeReplica::new();
        let create_a = run(&mut source, 1, "c1", folder("a", ROOT_ID));
        let create_b = run(&mut source, 2, "c1", folder("b", ROOT_ID));
        let early = run(&mut source, 3, "c1", move_to("a", "b"));
        let late = run(&mut source, 4, "c2", move_to("a", ROOT_ID));

        let mut target = TreeReplica::new();
        target.apply(&OpId::new(1, "c1"), &create_a);
        target.apply(&OpId::new(2, "c1"), &create_b);
        target.apply(&OpId::new(4, "c2"), &late);
        target.apply(&OpId::new(3, "c1"), &early);

        assert_eq!(target.parent_of("a").as_deref(), Some(ROOT_ID));
        assert_eq!(target.nodes(), source.nodes());
    }

    #[test]
    fn test_delete_wins_over_concurrent_rename() {
        let mut left = TreeReplica::new();
        run(&mut left, 1, "c1", folder("docs", ROOT_ID));
        let mut right = left.clone();

        let rename = run(
            &mut left,
            2,
            "c1",
            Intent::RenameNode {
                node: "docs".into(),
                name: "documentation".into(),
            },
        );
        let delete = run(
            &mut right,
            2,
            "c2",
            Intent::DeleteNodes {
                nodes: vec!["docs".into()],
            },
        );

        left.apply(&OpId::new(2, "c2"), &delete);
        right.apply(&OpId::new(2, "c1"), &rename);

        assert!(left.get("docs").is_none());
        assert!(right.get("docs").is_none());
        assert!(left.is_deleted("docs"));
    }

    #[test]
    fn test_live_child_of_deleted_folder_shows_under_ancestor() {
        let mut tree = TreeReplica::new();
        run(&mut tree, 1, "a", folder("outer", ROOT_ID));
        run(&mut tree, 2, "a", folder("inner", "outer"));
        // a concurrent client created "late" under inner before seeing the delete
        let late = TreeOp::Create {
            node: "late".into(),
            parent: "inner".into(),
            name: "late.txt".into(),
            kind: NodeKind::File,
            order_hint: 0.0,
        };
        tree.apply(
            &OpId::new(3, "a"),
            &TreeOp::Delete {
                nodes: vec!["inner".into()],
            },
        );
        tree.apply(&OpId::new(3, "b"), &late);

        assert_eq!(tree.parent_of("late").as_deref(), Some("outer"));
    }

    #[test]
    fn test_rename_revert_only_when_still_latest() {
        let mut tree = TreeReplica::new();
        run(&mut tree, 1, "a", folder("n", ROOT_ID));
        let rename = tree
            .prepare(&Intent::RenameNode {
                node: "n".into(),
                name: "mine".into(),
            })
            .unwrap();
        let mine = OpId::new(2, "a");
        let revert = tree.apply(&mine, &rename).unwrap();
        assert_eq!(
            tree.revert_intents(&mine, &revert),
            vec![Intent::RenameNode {
                node: "n".into(),
                name: "n".into()
            }]
        );

        tree.apply(
            &OpId::new(3, "b"),
            &TreeOp::Rename {
                node: "n".into(),
                name: "theirs".into(),
            },
        );
        assert!(tree.revert_intents(&mine, &revert).is_empty());
    }
}
