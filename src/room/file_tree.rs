//! File tree operations on top of a tree replica.
//!
//! The manager holds no state of its own: every call validates against the
//! current tree in the store and turns into one tree operation. Names are
//! checked here (empty names, path separators, sibling collisions) so the
//! replica only ever sees well-formed intents.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use uuid::Uuid;

use crate::crdt::{
    Applied, CrdtError, CrdtResult, Intent, NodeId, NodeKind, ReplicaStore, TreeNodeView,
    TreeReplica, ROOT_ID,
};

/// Replica that holds a room's file tree
pub const FILE_TREE_REPLICA: &str = "file-tree";

/// Nested representation for frontend consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedNode {
    pub id: NodeId,
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub children: Option<Vec<NestedNode>>,
}

/// Generate a unique node ID
pub fn generate_node_id() -> NodeId {
    Uuid::new_v4().to_string()
}

/// Check a file or folder name, returning it without surrounding whitespace
pub fn validate_name(name: &str) -> CrdtResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CrdtError::Validation("name must not be empty".into()));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(CrdtError::Validation(format!("{} is not a valid name", trimmed)));
    }
    if trimmed.contains('/') || trimmed.contains('\0') {
        return Err(CrdtError::Validation(format!(
            "name {:?} contains a path separator or NUL",
            trimmed
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone)]
pub struct FileTreeManager {
    replica: String,
}

impl Default for FileTreeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTreeManager {
    pub fn new() -> Self {
        Self::with_replica(FILE_TREE_REPLICA)
    }

    pub fn with_replica(replica: impl Into<String>) -> Self {
        Self {
            replica: replica.into(),
        }
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    fn tree<'a>(&self, store: &'a ReplicaStore) -> Cow<'a, TreeReplica> {
        match store.tree(&self.replica) {
            Some(tree) => Cow::Borrowed(tree),
            None => Cow::Owned(TreeReplica::new()),
        }
    }

    fn ensure_unique(
        tree: &TreeReplica,
        parent: &str,
        name: &str,
        except: Option<&str>,
    ) -> CrdtResult<()> {
        let taken = tree
            .children(parent)
            .iter()
            .any(|child| child.name == name && Some(child.id.as_str()) != except);
        if taken {
            return Err(CrdtError::InvalidOperation(format!(
                "{} already exists in {}",
                name, parent
            )));
        }
        Ok(())
    }

    pub fn create_file(
        &self,
        store: &mut ReplicaStore,
        parent: &str,
        name: &str,
    ) -> CrdtResult<(NodeId, Applied)> {
        self.create(store, parent, name, NodeKind::File)
    }

    pub fn create_folder(
        &self,
        store: &mut ReplicaStore,
        parent: &str,
        name: &str,
    ) -> CrdtResult<(NodeId, Applied)> {
        self.create(store, parent, name, NodeKind::Folder)
    }

    fn create(
        &self,
        store: &mut ReplicaStore,
        parent: &str,
        name: &str,
        kind: NodeKind,
    ) -> CrdtResult<(NodeId, Applied)> {
        let name = validate_name(name)?;
        let order_hint = {
            let tree = self.tree(store);
            if tree.kind(parent) != Some(NodeKind::Folder) {
                return Err(CrdtError::InvalidOperation(format!(
                    "parent {} is not an existing folder",
                    parent
                )));
            }
            Self::ensure_unique(&tree, parent, name, None)?;
            tree.children(parent)
                .iter()
                .map(|child| child.order_hint)
                .fold(0.0_f64, f64::max)
                + 1.0
        };

        let node = generate_node_id();
        let applied = store.apply_local_tracked(
            &self.replica,
            Intent::CreateNode {
                node: node.clone(),
                parent: parent.to_string(),
                name: name.to_string(),
                kind,
                order_hint,
            },
        )?;
        Ok((node, applied))
    }

    pub fn rename(&self, store: &mut ReplicaStore, node: &str, name: &str) -> CrdtResult<Applied> {
        let name = validate_name(name)?;
        {
            let tree = self.tree(store);
            if !tree.contains(node) || node == ROOT_ID {
                return Err(CrdtError::InvalidOperation(format!("node not found: {}", node)));
            }
            let parent = tree.parent_of(node).unwrap_or_else(|| ROOT_ID.to_string());
            Self::ensure_unique(&tree, &parent, name, Some(node))?;
        }
        store.apply_local_tracked(
            &self.replica,
            Intent::RenameNode {
                node: node.to_string(),
                name: name.to_string(),
            },
        )
    }

    pub fn move_node(
        &self,
        store: &mut ReplicaStore,
        node: &str,
        new_parent: &str,
    ) -> CrdtResult<Applied> {
        {
            let tree = self.tree(store);
            if node == ROOT_ID {
                return Err(CrdtError::InvalidOperation("the root cannot be moved".into()));
            }
            if tree.would_cycle(node, new_parent) {
                return Err(CrdtError::InvalidOperation(format!(
                    "{} cannot be moved into its own subtree",
                    node
                )));
            }
            if let Some(name) = tree.name(node) {
                Self::ensure_unique(&tree, new_parent, name, Some(node))?;
            }
        }
        store.apply_local_tracked(
            &self.replica,
            Intent::MoveNode {
                node: node.to_string(),
                parent: new_parent.to_string(),
                order_hint: None,
            },
        )
    }

    /// Delete a node and its whole live subtree in one operation
    pub fn delete_node(&self, store: &mut ReplicaStore, node: &str) -> CrdtResult<Applied> {
        if node == ROOT_ID {
            return Err(CrdtError::InvalidOperation("the root cannot be deleted".into()));
        }
        let nodes = {
            let tree = self.tree(store);
            if !tree.contains(node) {
                return Err(CrdtError::InvalidOperation(format!("node not found: {}", node)));
            }
            let mut nodes = vec![node.to_string()];
            nodes.extend(tree.descendants(node));
            nodes
        };
        store.apply_local_tracked(&self.replica, Intent::DeleteNodes { nodes })
    }

    /// All live nodes, depth first
    pub fn nodes(&self, store: &ReplicaStore) -> Vec<TreeNodeView> {
        self.tree(store).nodes()
    }

    pub fn children(&self, store: &ReplicaStore, parent: &str) -> Vec<TreeNodeView> {
        self.tree(store).children(parent)
    }

    /// Slash-separated path from the root; the root itself is `""`
    pub fn path_of(&self, store: &ReplicaStore, node: &str) -> Option<String> {
        let tree = self.tree(store);
        path_in(&tree, node)
    }

    pub fn to_nested(&self, store: &ReplicaStore) -> NestedNode {
        let tree = self.tree(store);
        node_to_nested(&tree, ROOT_ID, String::new(), String::new())
    }
}

fn path_in(tree: &TreeReplica, node: &str) -> Option<String> {
    if node == ROOT_ID {
        return Some(String::new());
    }
    let mut parts = vec![tree.name(node)?.to_string()];
    let mut current = tree.parent_of(node);
    while let Some(id) = current {
        if id == ROOT_ID {
            break;
        }
        parts.push(tree.name(&id)?.to_string());
        current = tree.parent_of(&id);
    }
    parts.reverse();
    Some(parts.join("/"))
}

fn node_to_nested(tree: &TreeReplica, id: &str, name: String, path: String) -> NestedNode {
    let is_dir = id == ROOT_ID || tree.kind(id) == Some(NodeKind::Folder);
    let children: Vec<NestedNode> = tree
        .children(id)
        .into_iter()
        .map(|child| {
            let child_path = if path.is_empty() {
                child.name.clone()
            } else {
                format!("{}/{}", path, child.name)
            };
            node_to_nested(tree, &child.id, child.name, child_path)
        })
        .collect();

    NestedNode {
        id: id.to_string(),
        name,
        path,
        is_dir,
        children: if children.is_empty() { None } else { Some(children) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ReplicaStore, FileTreeManager) {
        (ReplicaStore::new("alice"), FileTreeManager::new())
    }

    #[test]
    fn test_create_file_and_folder() {
        let (mut store, files) = setup();
        let (src, _) = files.create_folder(&mut store, ROOT_ID, "src").unwrap();
        let (main, applied) = files.create_file(&mut store, &src, "main.rs").unwrap();

        assert_eq!(applied.op.replica, FILE_TREE_REPLICA);
        assert_eq!(files.path_of(&store, &main).as_deref(), Some("src/main.rs"));
        assert_eq!(files.nodes(&store).len(), 2);
        assert_eq!(files.children(&store, &src)[0].id, main);
    }

    #[test]
    fn test_empty_name_emits_nothing() {
        let (mut store, files) = setup();
        let err = files.create_folder(&mut store, ROOT_ID, "").unwrap_err();

        assert!(matches!(err, CrdtError::Validation(_)));
        assert!(store.history().is_empty());
        assert_eq!(store.clock(), 0);
    }

    #[test]
    fn test_invalid_names() {
        for name in ["   ", ".", "..", "a/b", "nul\0"] {
            assert!(
                matches!(validate_name(name), Err(CrdtError::Validation(_))),
                "{:?} should be rejected",
                name
            );
        }
        assert_eq!(validate_name("  lib.rs ").unwrap(), "lib.rs");
    }

    #[test]
    fn test_parent_must_be_a_folder() {
        let (mut store, files) = setup();
        let (file, _) = files.create_file(&mut store, ROOT_ID, "README.md").unwrap();

        let err = files.create_file(&mut store, &file, "x").unwrap_err();
        assert!(matches!(err, CrdtError::InvalidOperation(_)));
        let err = files.create_file(&mut store, "missing", "x").unwrap_err();
        assert!(matches!(err, CrdtError::InvalidOperation(_)));
    }

    #[test]
    fn test_sibling_names_are_unique() {
        let (mut store, files) = setup();
        files.create_file(&mut store, ROOT_ID, "a.rs").unwrap();
        let (b, _) = files.create_file(&mut store, ROOT_ID, "b.rs").unwrap();

        assert!(matches!(
            files.create_file(&mut store, ROOT_ID, "a.rs"),
            Err(CrdtError::InvalidOperation(_))
        ));
        assert!(matches!(
            files.rename(&mut store, &b, "a.rs"),
            Err(CrdtError::InvalidOperation(_))
        ));
        // renaming to its own name is fine
        files.rename(&mut store, &b, "b.rs").unwrap();
    }

    #[test]
    fn test_move_into_descendant_is_rejected() {
        let (mut store, files) = setup();
        let (a, _) = files.create_folder(&mut store, ROOT_ID, "a").unwrap();
        let (b, _) = files.create_folder(&mut store, &a, "b").unwrap();
        let before = files.to_nested(&store);
        let history = store.history().len();

        let err = files.move_node(&mut store, &a, &b).unwrap_err();
        assert!(matches!(err, CrdtError::InvalidOperation(_)));
        assert!(matches!(
            files.move_node(&mut store, &a, &a),
            Err(CrdtError::InvalidOperation(_))
        ));
        assert!(matches!(
            files.move_node(&mut store, ROOT_ID, &a),
            Err(CrdtError::InvalidOperation(_))
        ));
        assert_eq!(files.to_nested(&store), before);
        assert_eq!(store.history().len(), history);
    }

    #[test]
    fn test_move_node() {
        let (mut store, files) = setup();
        let (src, _) = files.create_folder(&mut store, ROOT_ID, "src").unwrap();
        let (lib, _) = files.create_file(&mut store, ROOT_ID, "lib.rs").unwrap();

        files.move_node(&mut store, &lib, &src).unwrap();
        assert_eq!(files.path_of(&store, &lib).as_deref(), Some("src/lib.rs"));
        assert!(files.children(&store, ROOT_ID).iter().all(|c| c.id != lib));
    }

    #[test]
    fn test_delete_folder_is_one_operation() {
        let (mut store, files) = setup();
        let (src, _) = files.create_folder(&mut store, ROOT_ID, "src").unwrap();
        let (nested, _) = files.create_folder(&mut store, &src, "nested").unwrap();
        files.create_file(&mut store, &nested, "deep.rs").unwrap();
        files.create_file(&mut store, ROOT_ID, "keep.md").unwrap();
        let history = store.history().len();

        let applied = files.delete_node(&mut store, &src).unwrap();
        assert_eq!(store.history().len(), history + 1);
        match applied.op.payload {
            crate::crdt::Payload::Tree(crate::crdt::TreeOp::Delete { nodes }) => {
                assert_eq!(nodes.len(), 3)
            }
            other => panic!("Expected a delete, got {:?}", other),
        }
        let names: Vec<String> = files.nodes(&store).into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["keep.md".to_string()]);
    }

    #[test]
    fn test_root_cannot_be_deleted() {
        let (mut store, files) = setup();
        assert!(matches!(
            files.delete_node(&mut store, ROOT_ID),
            Err(CrdtError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_to_nested() {
        let (mut store, files) = setup();
        let (src, _) = files.create_folder(&mut store, ROOT_ID, "src").unwrap();
        files.create_file(&mut store, &src, "main.rs").unwrap();

        let nested = files.to_nested(&store);
        assert!(nested.is_dir);
        let children = nested.children.unwrap();
        assert_eq!(children[0].name, "src");
        let grandchildren = children[0].children.as_ref().unwrap();
        assert_eq!(grandchildren[0].path, "src/main.rs");
        assert!(!grandchildren[0].is_dir);
        assert!(grandchildren[0].children.is_none());
    }
}
