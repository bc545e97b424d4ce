//! Client-side mirror of the workspace tree.
//!
//! Only the parts of the tree a client has looked at are loaded. Nodes live
//! in an arena keyed by [`NodeId`] with a path index next to it; parents are
//! ids. A directory that was cut off by the fetch depth stays
//! `is_complete == false` until its children are fetched.
//!
//! The model does no I/O. [`FileTreeModelNetworkController`] decides when to
//! fetch.
//!
//! [`FileTreeModelNetworkController`]: super::FileTreeModelNetworkController

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::sync::messages::{DirInfo, TreeNodeInfo};
use crate::sync::FileEditSessionKey;
use crate::workspace::{file_name, join_path, normalize_path, parent_path, NodeKind, ROOT_PATH};

pub type NodeId = u64;

#[derive(Debug, Clone)]
pub struct FileTreeNode {
    pub id: NodeId,
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    pub file_edit_session_key: FileEditSessionKey,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// All children are loaded (always true for files)
    pub is_complete: bool,
    pub size: u64,
    /// Shown open in the tree view
    pub expanded: bool,
}

impl FileTreeNode {
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// What [`FileTreeModel::move_node`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The node now lives at the new path
    Moved,
    /// The node was dropped; its new parent is not loaded
    Removed,
    /// The node was never loaded but its new parent is, so the new path
    /// should be fetched
    NeedsFetch,
    /// Neither end is loaded
    Ignored,
}

/// Change notification sent to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeModelChange {
    NodeAdded { path: String },
    NodesRemoved { paths: Vec<String> },
    NodeMoved { old_path: String, new_path: String },
    NodeReplaced { path: String },
}

#[derive(Default)]
pub struct FileTreeModel {
    nodes: HashMap<NodeId, FileTreeNode>,
    paths: HashMap<String, NodeId>,
    root: Option<NodeId>,
    next_id: NodeId,
    last_applied_tree_mutation_revision: u64,
    disable_change_notifications: bool,
    subscribers: Vec<mpsc::UnboundedSender<TreeModelChange>>,
}

impl FileTreeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workspace_root(&self) -> Option<&FileTreeNode> {
        self.root.and_then(|id| self.nodes.get(&id))
    }

    pub fn node(&self, id: NodeId) -> Option<&FileTreeNode> {
        self.nodes.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn find_node(&self, path: &str) -> Option<&FileTreeNode> {
        self.paths
            .get(&normalize_path(path))
            .and_then(|id| self.nodes.get(id))
    }

    /// The node at `path`, or its nearest loaded ancestor
    pub fn find_closest_node(&self, path: &str) -> Option<&FileTreeNode> {
        let mut current = Some(normalize_path(path));
        while let Some(path) = current {
            if let Some(node) = self.find_node(&path) {
                return Some(node);
            }
            current = parent_path(&path);
        }
        None
    }

    pub fn children(&self, path: &str) -> Vec<&FileTreeNode> {
        self.find_node(path)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_applied_tree_mutation_revision(&self) -> u64 {
        self.last_applied_tree_mutation_revision
    }

    /// Move the revision forward to `revision`; it never goes back
    pub fn maybe_set_last_applied_tree_mutation_revision(&mut self, revision: &str) {
        match revision.parse::<u64>() {
            Ok(revision) => {
                self.last_applied_tree_mutation_revision =
                    self.last_applied_tree_mutation_revision.max(revision);
            }
            Err(e) => error!("Tree revision {:?} is not numeric: {}", revision, e),
        }
    }

    pub fn set_disable_change_notifications(&mut self, disable: bool) {
        self.disable_change_notifications = disable;
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TreeModelChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Add a node under its parent. Only applied when the parent is loaded
    /// and complete; the revision moves forward either way.
    pub fn add_node(&mut self, path: &str, info: &TreeNodeInfo, revision: &str) -> bool {
        let path = normalize_path(path);
        let added = match self.complete_parent(&path) {
            Some(parent) => {
                self.remove_subtree_at(&path);
                self.insert_info(parent, &path, info);
                true
            }
            None => {
                debug!("Not adding {}; its parent is not loaded", path);
                false
            }
        };

        if added {
            self.dispatch(TreeModelChange::NodeAdded { path }, revision);
        } else {
            self.maybe_set_last_applied_tree_mutation_revision(revision);
        }
        added
    }

    /// Give an existing node the session key the server assigned to it
    pub fn set_file_edit_session_key(&mut self, path: &str, key: &str, revision: &str) -> bool {
        let path = normalize_path(path);
        let Some(id) = self.paths.get(&path).copied() else {
            return false;
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            node.file_edit_session_key = key.to_string();
        }
        self.dispatch(TreeModelChange::NodeAdded { path }, revision);
        true
    }

    /// Remove loaded nodes. Returns the paths actually removed.
    pub fn remove_nodes(&mut self, paths: &[String], revision: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for path in paths {
            let path = normalize_path(path);
            if path == ROOT_PATH {
                warn!("Refusing to remove the workspace root");
                continue;
            }
            if self.remove_subtree_at(&path) {
                removed.push(path);
            }
        }

        if removed.is_empty() {
            self.maybe_set_last_applied_tree_mutation_revision(revision);
        } else {
            self.dispatch(
                TreeModelChange::NodesRemoved {
                    paths: removed.clone(),
                },
                revision,
            );
        }
        removed
    }

    pub fn move_node(&mut self, old_path: &str, new_path: &str, revision: &str) -> MoveOutcome {
        let old_path = normalize_path(old_path);
        let new_path = normalize_path(new_path);
        if old_path == new_path {
            debug!("Ignoring move of {} onto itself", old_path);
            self.maybe_set_last_applied_tree_mutation_revision(revision);
            return MoveOutcome::Ignored;
        }
        let old_id = self.paths.get(&old_path).copied();
        let new_parent = self.complete_parent(&new_path);

        let outcome = match (old_id, new_parent) {
            (Some(id), Some(parent)) => {
                self.detach(id);
                self.remove_subtree_at(&new_path);
                self.attach(id, parent, &new_path);
                MoveOutcome::Moved
            }
            (Some(_), None) => {
                self.remove_subtree_at(&old_path);
                MoveOutcome::Removed
            }
            (None, Some(parent)) => {
                // Force the parent to be fetched again.
                if let Some(node) = self.nodes.get_mut(&parent) {
                    node.is_complete = false;
                }
                MoveOutcome::NeedsFetch
            }
            (None, None) => MoveOutcome::Ignored,
        };

        match outcome {
            MoveOutcome::Moved => self.dispatch(
                TreeModelChange::NodeMoved { old_path, new_path },
                revision,
            ),
            MoveOutcome::Removed => self.dispatch(
                TreeModelChange::NodesRemoved {
                    paths: vec![old_path],
                },
                revision,
            ),
            MoveOutcome::NeedsFetch | MoveOutcome::Ignored => {
                self.maybe_set_last_applied_tree_mutation_revision(revision)
            }
        }
        outcome
    }

    /// Install a fetched directory. The root path replaces the whole tree;
    /// any other path only replaces a node that is already loaded.
    pub fn replace_node(&mut self, path: &str, dir: &DirInfo, revision: &str) -> bool {
        let path = normalize_path(path);
        let expanded = self.expanded_paths_under(&path);

        if path == ROOT_PATH {
            self.nodes.clear();
            self.paths.clear();
            let id = self.allocate(FileTreeNode {
                id: 0,
                name: String::new(),
                path: ROOT_PATH.to_string(),
                kind: NodeKind::Directory,
                file_edit_session_key: dir.file_edit_session_key.clone(),
                parent: None,
                children: Vec::new(),
                is_complete: dir.is_complete,
                size: 0,
                expanded: true,
            });
            self.root = Some(id);
            self.insert_children(id, ROOT_PATH, dir);
        } else {
            let Some(id) = self.paths.get(&path).copied() else {
                debug!("Not replacing {}; it is not loaded", path);
                self.maybe_set_last_applied_tree_mutation_revision(revision);
                return false;
            };
            let Some(parent) = self.nodes.get(&id).and_then(|node| node.parent) else {
                return false;
            };
            self.remove_subtree_at(&path);
            self.insert_info(parent, &path, &TreeNodeInfo::Directory(dir.clone()));
        }

        for expanded_path in expanded {
            if let Some(id) = self.paths.get(&expanded_path).copied() {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.expanded = true;
                }
            }
        }

        self.dispatch(TreeModelChange::NodeReplaced { path }, revision);
        true
    }

    /// Mark a directory open or closed in the view
    pub fn set_expanded(&mut self, path: &str, expanded: bool) -> bool {
        let path = normalize_path(path);
        match self.paths.get(&path).and_then(|id| self.nodes.get_mut(id)) {
            Some(node) if node.is_directory() => {
                node.expanded = expanded;
                true
            }
            _ => false,
        }
    }

    /// The deepest expanded directories, reachable from the root through
    /// expanded directories only
    pub fn calculate_expanded_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if let Some(root) = self.root {
            self.collect_expanded(root, &mut paths);
        }
        paths
    }

    fn collect_expanded(&self, id: NodeId, paths: &mut Vec<String>) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if Some(id) != self.root && !node.expanded {
            return;
        }

        let before = paths.len();
        for child in &node.children {
            if self.nodes.get(child).is_some_and(FileTreeNode::is_directory) {
                self.collect_expanded(*child, paths);
            }
        }
        if paths.len() == before {
            paths.push(node.path.clone());
        }
    }

    fn expanded_paths_under(&self, path: &str) -> Vec<String> {
        let prefix = if path == ROOT_PATH {
            ROOT_PATH.to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .values()
            .filter(|node| node.expanded && (node.path == path || node.path.starts_with(&prefix)))
            .map(|node| node.path.clone())
            .collect()
    }

    /// Id of the loaded, complete directory `path` would live in
    fn complete_parent(&self, path: &str) -> Option<NodeId> {
        let parent = parent_path(path)?;
        let id = *self.paths.get(&parent)?;
        let node = self.nodes.get(&id)?;
        (node.is_directory() && node.is_complete).then_some(id)
    }

    fn allocate(&mut self, mut node: FileTreeNode) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        node.id = id;
        self.paths.insert(node.path.clone(), id);
        self.nodes.insert(id, node);
        id
    }

    fn insert_info(&mut self, parent: NodeId, path: &str, info: &TreeNodeInfo) -> NodeId {
        let (kind, size, is_complete) = match info {
            TreeNodeInfo::File(file) => (NodeKind::File, file.size, true),
            TreeNodeInfo::Directory(dir) => (NodeKind::Directory, 0, dir.is_complete),
        };
        let id = self.allocate(FileTreeNode {
            id: 0,
            name: file_name(path).to_string(),
            path: path.to_string(),
            kind,
            file_edit_session_key: info.file_edit_session_key().to_string(),
            parent: Some(parent),
            children: Vec::new(),
            is_complete,
            size,
            expanded: false,
        });
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.push(id);
        }
        if let TreeNodeInfo::Directory(dir) = info {
            self.insert_children(id, path, dir);
        }
        id
    }

    fn insert_children(&mut self, id: NodeId, path: &str, dir: &DirInfo) {
        for sub in &dir.sub_directories {
            let child_path = join_path(path, &sub.name);
            self.insert_info(id, &child_path, &TreeNodeInfo::Directory(sub.clone()));
        }
        for file in &dir.files {
            let child_path = join_path(path, &file.name);
            self.insert_info(id, &child_path, &TreeNodeInfo::File(file.clone()));
        }
    }

    /// Remove the node at `path` and everything below it
    fn remove_subtree_at(&mut self, path: &str) -> bool {
        let Some(id) = self.paths.get(path).copied() else {
            return false;
        };
        self.detach(id);

        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                self.paths.remove(&node.path);
                stack.extend(node.children);
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }
        true
    }

    fn detach(&mut self, id: NodeId) {
        let parent = self.nodes.get(&id).and_then(|node| node.parent);
        if let Some(parent) = parent.and_then(|parent| self.nodes.get_mut(&parent)) {
            parent.children.retain(|child| *child != id);
        }
    }

    /// Hang `id` under `parent` at `new_path`, re-pathing its subtree
    fn attach(&mut self, id: NodeId, parent: NodeId, new_path: &str) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
            node.name = file_name(new_path).to_string();
        }
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.push(id);
        }

        let mut stack = vec![(id, new_path.to_string())];
        while let Some((id, path)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let old_path = std::mem::replace(&mut node.path, path.clone());
            let children = node.children.clone();
            self.paths.remove(&old_path);
            self.paths.insert(path.clone(), id);
            for child in children {
                if let Some(name) = self.nodes.get(&child).map(|c| c.name.clone()) {
                    stack.push((child, join_path(&path, &name)));
                }
            }
        }
    }

    fn dispatch(&mut self, change: TreeModelChange, revision: &str) {
        self.maybe_set_last_applied_tree_mutation_revision(revision);
        if self.disable_change_notifications {
            return;
        }
        self.subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::messages::FileInfo;

    fn file(name: &str, key: &str) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            file_edit_session_key: key.to_string(),
            size: 3,
        }
    }

    /// / with /a (complete, holding b.txt) and /lazy (cut off)
    fn loaded_model() -> FileTreeModel {
        let mut a = DirInfo::new("a", "2");
        a.files.push(file("b.txt", "3"));
        let mut lazy = DirInfo::new("lazy", "4");
        lazy.is_complete = false;
        let mut root = DirInfo::new("", "0");
        root.sub_directories.push(a);
        root.sub_directories.push(lazy);
        root.files.push(file("README.md", "1"));

        let mut model = FileTreeModel::new();
        assert!(model.replace_node("/", &root, "5"));
        model
    }

    #[test]
    fn test_root_replace_installs_tree() {
        let model = loaded_model();
        assert_eq!(model.last_applied_tree_mutation_revision(), 5);
        assert_eq!(model.workspace_root().unwrap().path, "/");
        assert_eq!(model.find_node("/a/b.txt").unwrap().file_edit_session_key, "3");
        assert!(!model.find_node("/lazy").unwrap().is_complete);
        assert_eq!(model.children("/").len(), 3);
    }

    #[test]
    fn test_add_and_delete() {
        let mut model = loaded_model();
        assert!(model.add_node("/a/c.txt", &TreeNodeInfo::File(file("c.txt", "9")), "6"));
        assert_eq!(model.find_node("/a/c.txt").unwrap().name, "c.txt");
        assert_eq!(model.last_applied_tree_mutation_revision(), 6);

        let removed = model.remove_nodes(&["/a/b.txt".to_string()], "7");
        assert_eq!(removed, vec!["/a/b.txt".to_string()]);
        assert!(model.find_node("/a/b.txt").is_none());
        assert_eq!(model.last_applied_tree_mutation_revision(), 7);
    }

    #[test]
    fn test_add_under_incomplete_parent_only_bumps_revision() {
        let mut model = loaded_model();
        assert!(!model.add_node("/lazy/x.txt", &TreeNodeInfo::File(file("x.txt", "9")), "6"));
        assert!(model.find_node("/lazy/x.txt").is_none());
        assert_eq!(model.last_applied_tree_mutation_revision(), 6);
    }

    #[test]
    fn test_delete_directory_removes_subtree() {
        let mut model = loaded_model();
        let before = model.node_count();
        model.remove_nodes(&["/a".to_string()], "6");
        assert!(model.find_node("/a").is_none());
        assert!(model.find_node("/a/b.txt").is_none());
        assert_eq!(model.node_count(), before - 2);
    }

    #[test]
    fn test_move_outcomes() {
        let mut model = loaded_model();

        assert_eq!(model.move_node("/a", "/renamed", "6"), MoveOutcome::Moved);
        let moved = model.find_node("/renamed/b.txt").unwrap();
        assert_eq!(moved.file_edit_session_key, "3");
        assert!(model.find_node("/a/b.txt").is_none());

        assert_eq!(
            model.move_node("/renamed/b.txt", "/lazy/b.txt", "7"),
            MoveOutcome::Removed
        );
        assert!(model.find_node("/renamed/b.txt").is_none());

        assert_eq!(
            model.move_node("/lazy/other.txt", "/renamed/other.txt", "8"),
            MoveOutcome::NeedsFetch
        );
        assert!(!model.find_node("/renamed").unwrap().is_complete);

        assert_eq!(
            model.move_node("/lazy/x", "/lazy/y", "9"),
            MoveOutcome::Ignored
        );
        assert_eq!(model.last_applied_tree_mutation_revision(), 9);
    }

    #[test]
    fn test_move_onto_itself_is_ignored() {
        let mut model = loaded_model();
        let before = model.node_count();

        assert_eq!(model.move_node("/a", "/a/", "6"), MoveOutcome::Ignored);
        assert_eq!(model.move_node("/a/b.txt", "/a/b.txt", "7"), MoveOutcome::Ignored);

        assert_eq!(model.node_count(), before);
        assert_eq!(model.find_node("/a/b.txt").unwrap().file_edit_session_key, "3");
        assert_eq!(model.children("/a").len(), 1);
        assert_eq!(model.children("/").len(), 3);
        assert_eq!(model.last_applied_tree_mutation_revision(), 7);
    }

    #[test]
    fn test_revision_only_moves_forward() {
        let mut model = FileTreeModel::new();
        model.maybe_set_last_applied_tree_mutation_revision("12");
        model.maybe_set_last_applied_tree_mutation_revision("10");
        model.maybe_set_last_applied_tree_mutation_revision("not-a-number");
        assert_eq!(model.last_applied_tree_mutation_revision(), 12);
    }

    #[test]
    fn test_subtree_replace_keeps_expansion() {
        let mut model = loaded_model();
        model.set_expanded("/a", true);

        let mut a = DirInfo::new("a", "2");
        a.files.push(file("new.txt", "10"));
        assert!(model.replace_node("/a", &a, "6"));
        assert!(model.find_node("/a/b.txt").is_none());
        assert!(model.find_node("/a/new.txt").is_some());
        assert!(model.find_node("/a").unwrap().expanded);

        // Unknown subtrees are not patched in.
        assert!(!model.replace_node("/missing", &DirInfo::new("missing", "11"), "7"));
        assert!(model.find_node("/missing").is_none());
    }

    #[test]
    fn test_calculate_expanded_paths() {
        let mut model = loaded_model();
        assert_eq!(model.calculate_expanded_paths(), vec!["/".to_string()]);

        model.set_expanded("/a", true);
        model.set_expanded("/lazy", true);
        let mut paths = model.calculate_expanded_paths();
        paths.sort();
        assert_eq!(paths, vec!["/a".to_string(), "/lazy".to_string()]);
    }

    #[test]
    fn test_change_notifications() {
        let mut model = loaded_model();
        let mut changes = model.subscribe();

        model.add_node("/a/c.txt", &TreeNodeInfo::File(file("c.txt", "9")), "6");
        assert_eq!(
            changes.try_recv().unwrap(),
            TreeModelChange::NodeAdded {
                path: "/a/c.txt".to_string()
            }
        );

        model.set_disable_change_notifications(true);
        model.remove_nodes(&["/a/c.txt".to_string()], "7");
        assert!(changes.try_recv().is_err());
        assert_eq!(model.last_applied_tree_mutation_revision(), 7);
    }
}
