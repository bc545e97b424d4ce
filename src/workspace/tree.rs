//! Id-indexed workspace tree.
//!
//! Every node gets a resource id from a monotonic allocator when it enters
//! the tree. The id never changes when the node moves, so it serves as the
//! file edit session key. Paths are kept in an index for lookups and are
//! rewritten for a whole subtree on move.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    file_name, is_binary_extension, join_path, normalize_path, parent_path, ScanOptions,
    TreeError, TreeResult, ROOT_PATH,
};
use crate::storage::DiskStore;
use crate::sync::messages::{
    DirInfo, FileInfo, GetDirectoryResponse, Mutation, MutationType, TreeNodeInfo,
    WorkspaceTreeUpdate, WorkspaceTreeUpdateBroadcast,
};
use crate::sync::FileEditSessionKey;

/// Type of workspace node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
}

/// A node in the workspace tree (file or directory)
#[derive(Debug, Clone)]
pub struct WorkspaceNode {
    /// Resource id, also the file edit session key
    pub key: FileEditSessionKey,
    /// Node name (filename or directory name)
    pub name: String,
    /// Workspace path, `/` for the root
    pub path: String,
    pub kind: NodeKind,
    /// Parent resource id (None for root)
    pub parent: Option<FileEditSessionKey>,
    /// Child resource ids (for directories)
    pub children: Vec<FileEditSessionKey>,
    /// File size in bytes
    pub size: u64,
}

impl WorkspaceNode {
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Result of scanning the workspace directory
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    /// Total number of files found
    pub file_count: usize,
    /// Total number of folders found, root included
    pub folder_count: usize,
    /// Total size in bytes
    pub total_size: u64,
    /// Files that were skipped (too large, binary)
    pub skipped_files: Vec<String>,
}

/// Outcome of applying a `WorkspaceTreeUpdate`.
///
/// Mutations are applied in order and processing stops at the first
/// failure. Whatever was applied before it is still broadcast.
#[derive(Debug, Default)]
pub struct AppliedUpdate {
    pub broadcast: Option<WorkspaceTreeUpdateBroadcast>,
    pub error: Option<TreeError>,
}

/// The server's authoritative view of the workspace
#[derive(Debug)]
pub struct WorkspaceTree {
    disk: DiskStore,
    nodes: HashMap<FileEditSessionKey, WorkspaceNode>,
    path_index: HashMap<String, FileEditSessionKey>,
    root_key: FileEditSessionKey,
    next_id: u64,
    tree_version: u64,
}

impl WorkspaceTree {
    /// Create a tree holding only the root directory
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        let root_name = root_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut tree = Self {
            disk: DiskStore::new(root_dir),
            nodes: HashMap::new(),
            path_index: HashMap::new(),
            root_key: String::new(),
            next_id: 0,
            tree_version: 0,
        };

        let root_key = tree.allocate_key();
        tree.path_index
            .insert(ROOT_PATH.to_string(), root_key.clone());
        tree.nodes.insert(
            root_key.clone(),
            WorkspaceNode {
                key: root_key.clone(),
                name: root_name,
                path: ROOT_PATH.to_string(),
                kind: NodeKind::Directory,
                parent: None,
                children: Vec::new(),
                size: 0,
            },
        );
        tree.root_key = root_key;
        tree
    }

    /// Scan a directory on disk and build the tree from it
    pub fn scan(
        root_dir: impl Into<PathBuf>,
        options: &ScanOptions,
    ) -> TreeResult<(Self, ScanSummary)> {
        let root_dir = root_dir.into();
        if !root_dir.is_dir() {
            return Err(TreeError::NotADirectory(root_dir.display().to_string()));
        }

        let mut tree = Self::new(root_dir.clone());
        let mut summary = ScanSummary {
            folder_count: 1, // Count root
            ..Default::default()
        };

        let root_key = tree.root_key.clone();
        tree.scan_recursive(&root_dir, &root_key, options, 0, &mut summary)?;

        info!(
            "Scanned workspace {}: {} files, {} folders, {} skipped",
            root_dir.display(),
            summary.file_count,
            summary.folder_count,
            summary.skipped_files.len()
        );

        Ok((tree, summary))
    }

    fn scan_recursive(
        &mut self,
        dir: &Path,
        parent_key: &str,
        options: &ScanOptions,
        depth: usize,
        summary: &mut ScanSummary,
    ) -> TreeResult<()> {
        if options.max_depth > 0 && depth > options.max_depth {
            return Ok(());
        }
        if summary.file_count >= options.max_files {
            return Ok(());
        }

        let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();

        // Sort: directories first, then by name
        entries.sort_by(|a, b| {
            let a_is_dir = a.path().is_dir();
            let b_is_dir = b.path().is_dir();
            match (a_is_dir, b_is_dir) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => a.file_name().cmp(&b.file_name()),
            }
        });

        let parent_path = self
            .nodes
            .get(parent_key)
            .map(|n| n.path.clone())
            .ok_or_else(|| TreeError::NotFound(parent_key.to_string()))?;

        for entry in entries {
            if summary.file_count >= options.max_files {
                break;
            }

            let entry_path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let workspace_path = join_path(&parent_path, &name);

            if options.should_exclude(&workspace_path, &name) {
                continue;
            }

            if entry_path.is_dir() {
                let dir_key = self.insert(parent_key, &name, NodeKind::Directory, 0)?;
                summary.folder_count += 1;
                self.scan_recursive(&entry_path, &dir_key, options, depth + 1, summary)?;
            } else if entry_path.is_file() {
                if is_binary_extension(&name) {
                    summary.skipped_files.push(workspace_path);
                    continue;
                }

                let size = entry.metadata()?.len();
                if size > options.max_file_size {
                    summary.skipped_files.push(workspace_path);
                    continue;
                }

                self.insert(parent_key, &name, NodeKind::File, size)?;
                summary.file_count += 1;
                summary.total_size += size;
            }
        }

        Ok(())
    }

    pub fn tree_version(&self) -> u64 {
        self.tree_version
    }

    pub fn root_key(&self) -> &str {
        &self.root_key
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, key: &str) -> Option<&WorkspaceNode> {
        self.nodes.get(key)
    }

    pub fn node_by_path(&self, path: &str) -> Option<&WorkspaceNode> {
        self.path_index
            .get(&normalize_path(path))
            .and_then(|key| self.nodes.get(key))
    }

    /// Current path of a resource
    pub fn path_for_key(&self, key: &str) -> Option<&str> {
        self.nodes.get(key).map(|n| n.path.as_str())
    }

    /// Resource id at a path
    pub fn key_for_path(&self, path: &str) -> Option<&str> {
        self.path_index
            .get(&normalize_path(path))
            .map(|k| k.as_str())
    }

    pub fn set_file_size(&mut self, key: &str, size: u64) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.size = size;
        }
    }

    /// Map a workspace path onto the disk
    pub fn resolve(&self, path: &str) -> TreeResult<PathBuf> {
        Ok(self.disk.resolve(path)?)
    }

    /// List a directory. A negative depth means unlimited.
    pub fn get_directory(&self, path: &str, depth: i32) -> GetDirectoryResponse {
        let path = normalize_path(path);
        let remaining = u32::try_from(depth).ok();
        let base_directory = self
            .node_by_path(&path)
            .filter(|node| node.is_directory())
            .map(|node| self.dir_info(node, remaining));

        GetDirectoryResponse {
            path,
            base_directory,
            root_id: self.tree_version.to_string(),
        }
    }

    /// Describe a node the way `GetDirectory` and tree broadcasts do
    pub fn node_info(&self, key: &str, depth: Option<u32>) -> TreeResult<TreeNodeInfo> {
        let node = self
            .nodes
            .get(key)
            .ok_or_else(|| TreeError::NotFound(key.to_string()))?;
        Ok(match node.kind {
            NodeKind::File => TreeNodeInfo::File(file_info(node)),
            NodeKind::Directory => TreeNodeInfo::Directory(self.dir_info(node, depth)),
        })
    }

    fn dir_info(&self, node: &WorkspaceNode, remaining: Option<u32>) -> DirInfo {
        let mut info = DirInfo::new(&node.name, &node.key);
        if remaining == Some(0) {
            info.is_complete = node.children.is_empty();
            return info;
        }

        let next = remaining.map(|r| r - 1);
        let mut children: Vec<&WorkspaceNode> = node
            .children
            .iter()
            .filter_map(|key| self.nodes.get(key))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));

        for child in children {
            match child.kind {
                NodeKind::File => info.files.push(file_info(child)),
                NodeKind::Directory => info.sub_directories.push(self.dir_info(child, next)),
            }
        }
        info
    }

    /// Apply a batch of mutations to disk and to the tree.
    ///
    /// The tree version is bumped once if anything was applied.
    pub async fn apply_mutations(&mut self, update: &WorkspaceTreeUpdate) -> AppliedUpdate {
        let mut applied = Vec::with_capacity(update.mutations.len());
        let mut error = None;

        for mutation in &update.mutations {
            match self.apply_mutation(mutation).await {
                Ok(done) => applied.push(done),
                Err(e) => {
                    warn!(
                        "Tree mutation {:?} {} -> {} failed: {}",
                        mutation.mutation_type, mutation.old_path, mutation.new_path, e
                    );
                    error = Some(e);
                    break;
                }
            }
        }

        if applied.is_empty() {
            return AppliedUpdate {
                broadcast: None,
                error,
            };
        }

        self.tree_version += 1;
        debug!(
            "Applied {} tree mutations from {}, tree version {}",
            applied.len(),
            update.author_client_id,
            self.tree_version
        );

        AppliedUpdate {
            broadcast: Some(WorkspaceTreeUpdateBroadcast {
                author_client_id: update.author_client_id.clone(),
                mutations: applied,
                new_tree_version: self.tree_version.to_string(),
            }),
            error,
        }
    }

    async fn apply_mutation(&mut self, mutation: &Mutation) -> TreeResult<Mutation> {
        match mutation.mutation_type {
            MutationType::Add => {
                let path = normalize_path(&mutation.new_path);
                let info = mutation.new_node_info.as_ref().ok_or_else(|| {
                    TreeError::InvalidMutation(format!("ADD {} without node info", path))
                })?;
                let parent_key = self.parent_directory_key(&path)?;
                if self.path_index.contains_key(&path) {
                    return Err(TreeError::PathExists(path));
                }

                let local = self.resolve(&path)?;
                let kind = if info.is_directory() {
                    tokio::fs::create_dir(&local).await?;
                    NodeKind::Directory
                } else {
                    tokio::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&local)
                        .await?;
                    NodeKind::File
                };

                let key = self.insert(&parent_key, file_name(&path), kind, 0)?;
                Ok(Mutation::add(path, self.node_info(&key, Some(0))?))
            }

            MutationType::Delete => {
                let path = normalize_path(&mutation.old_path);
                let key = self.movable_key(&path)?;

                let local = self.resolve(&path)?;
                if self.nodes.get(&key).map(|n| n.is_directory()).unwrap_or(false) {
                    tokio::fs::remove_dir_all(&local).await?;
                } else {
                    tokio::fs::remove_file(&local).await?;
                }

                self.remove_subtree(&key);
                Ok(Mutation::delete(path))
            }

            MutationType::Move => {
                let old_path = normalize_path(&mutation.old_path);
                let new_path = normalize_path(&mutation.new_path);
                let key = self.movable_key(&old_path)?;
                let new_parent_key = self.parent_directory_key(&new_path)?;

                if self.path_index.contains_key(&new_path) {
                    return Err(TreeError::PathExists(new_path));
                }
                if self.is_ancestor_of(&key, &new_parent_key) {
                    return Err(TreeError::CircularMove);
                }

                tokio::fs::rename(self.resolve(&old_path)?, self.resolve(&new_path)?).await?;

                self.detach(&key);
                if let Some(node) = self.nodes.get_mut(&key) {
                    node.parent = Some(new_parent_key.clone());
                    node.name = file_name(&new_path).to_string();
                }
                if let Some(parent) = self.nodes.get_mut(&new_parent_key) {
                    parent.children.push(key.clone());
                }
                self.update_paths(&key, &new_path);

                Ok(Mutation::moved(old_path, new_path))
            }

            MutationType::Copy => {
                let old_path = normalize_path(&mutation.old_path);
                let new_path = normalize_path(&mutation.new_path);
                let source_key = self
                    .key_for_path(&old_path)
                    .map(str::to_string)
                    .ok_or_else(|| TreeError::NotFound(old_path.clone()))?;
                let new_parent_key = self.parent_directory_key(&new_path)?;

                if self.path_index.contains_key(&new_path) {
                    return Err(TreeError::PathExists(new_path));
                }
                if self.is_ancestor_of(&source_key, &new_parent_key) {
                    return Err(TreeError::CircularMove);
                }

                copy_on_disk(&self.resolve(&old_path)?, &self.resolve(&new_path)?).await?;
                let copy_key =
                    self.copy_subtree(&source_key, &new_parent_key, file_name(&new_path))?;

                let mut done = Mutation::copy(old_path, new_path);
                done.new_node_info = Some(self.node_info(&copy_key, None)?);
                Ok(done)
            }
        }
    }

    fn allocate_key(&mut self) -> FileEditSessionKey {
        let key = self.next_id.to_string();
        self.next_id += 1;
        key
    }

    /// Insert a new child under `parent_key` and return its resource id
    fn insert(
        &mut self,
        parent_key: &str,
        name: &str,
        kind: NodeKind,
        size: u64,
    ) -> TreeResult<FileEditSessionKey> {
        let parent = self
            .nodes
            .get(parent_key)
            .ok_or_else(|| TreeError::NotFound(parent_key.to_string()))?;
        if !parent.is_directory() {
            return Err(TreeError::NotADirectory(parent.path.clone()));
        }

        let path = join_path(&parent.path, name);
        if self.path_index.contains_key(&path) {
            return Err(TreeError::PathExists(path));
        }

        let key = self.allocate_key();
        if let Some(parent) = self.nodes.get_mut(parent_key) {
            parent.children.push(key.clone());
        }
        self.path_index.insert(path.clone(), key.clone());
        self.nodes.insert(
            key.clone(),
            WorkspaceNode {
                key: key.clone(),
                name: name.to_string(),
                path,
                kind,
                parent: Some(parent_key.to_string()),
                children: Vec::new(),
                size,
            },
        );
        Ok(key)
    }

    fn parent_directory_key(&self, path: &str) -> TreeResult<FileEditSessionKey> {
        let parent = parent_path(path).ok_or(TreeError::CannotModifyRoot)?;
        let node = self
            .node_by_path(&parent)
            .ok_or_else(|| TreeError::NotFound(parent.clone()))?;
        if !node.is_directory() {
            return Err(TreeError::NotADirectory(parent));
        }
        Ok(node.key.clone())
    }

    fn movable_key(&self, path: &str) -> TreeResult<FileEditSessionKey> {
        let key = self
            .key_for_path(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        if key == self.root_key {
            return Err(TreeError::CannotModifyRoot);
        }
        Ok(key.to_string())
    }

    fn detach(&mut self, key: &str) {
        let parent_key = self.nodes.get(key).and_then(|n| n.parent.clone());
        if let Some(parent) = parent_key.and_then(|pk| self.nodes.get_mut(&pk)) {
            parent.children.retain(|child| child != key);
        }
    }

    fn collect_subtree(&self, key: &str, result: &mut Vec<FileEditSessionKey>) {
        result.push(key.to_string());
        if let Some(node) = self.nodes.get(key) {
            for child in &node.children {
                self.collect_subtree(child, result);
            }
        }
    }

    fn remove_subtree(&mut self, key: &str) -> Vec<WorkspaceNode> {
        let mut keys = Vec::new();
        self.collect_subtree(key, &mut keys);
        self.detach(key);

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(node) = self.nodes.remove(&key) {
                self.path_index.remove(&node.path);
                removed.push(node);
            }
        }
        removed
    }

    fn update_paths(&mut self, key: &str, new_path: &str) {
        let children = match self.nodes.get_mut(key) {
            Some(node) => {
                let old_path = std::mem::replace(&mut node.path, new_path.to_string());
                self.path_index.remove(&old_path);
                node.children.clone()
            }
            None => return,
        };
        self.path_index
            .insert(new_path.to_string(), key.to_string());

        for child in children {
            let child_name = match self.nodes.get(&child) {
                Some(node) => node.name.clone(),
                None => continue,
            };
            self.update_paths(&child, &join_path(new_path, &child_name));
        }
    }

    fn copy_subtree(
        &mut self,
        source_key: &str,
        parent_key: &str,
        name: &str,
    ) -> TreeResult<FileEditSessionKey> {
        let (kind, size, children) = {
            let source = self
                .nodes
                .get(source_key)
                .ok_or_else(|| TreeError::NotFound(source_key.to_string()))?;
            (source.kind, source.size, source.children.clone())
        };

        let copy_key = self.insert(parent_key, name, kind, size)?;
        for child in children {
            let child_name = match self.nodes.get(&child) {
                Some(node) => node.name.clone(),
                None => continue,
            };
            self.copy_subtree(&child, &copy_key, &child_name)?;
        }
        Ok(copy_key)
    }

    /// Check if node A is an ancestor of (or the same as) node B
    fn is_ancestor_of(&self, ancestor: &str, descendant: &str) -> bool {
        let mut current = Some(descendant.to_string());
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = self.nodes.get(&key).and_then(|n| n.parent.clone());
        }
        false
    }
}

fn file_info(node: &WorkspaceNode) -> FileInfo {
    FileInfo {
        name: node.name.clone(),
        file_edit_session_key: node.key.clone(),
        size: node.size,
    }
}

async fn copy_on_disk(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((source, target)) = pending.pop() {
        if tokio::fs::metadata(&source).await?.is_dir() {
            tokio::fs::create_dir(&target).await?;
            let mut entries = tokio::fs::read_dir(&source).await?;
            while let Some(entry) = entries.next_entry().await? {
                pending.push((entry.path(), target.join(entry.file_name())));
            }
        } else {
            tokio::fs::copy(&source, &target).await?;
        }
    }
    Ok(())
}
