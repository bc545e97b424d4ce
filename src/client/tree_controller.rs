//! Keeps a [`FileTreeModel`] in sync with the server.
//!
//! Tree broadcasts are applied incrementally when they follow the last
//! applied revision. When one is missing, or arrives out of sequence, the
//! affected directory is fetched again and replaced wholesale; there is no
//! attempt to repair the tree op by op.

use tracing::{debug, error, warn};

use super::file_tree_model::{FileTreeModel, MoveOutcome};
use super::{ClientConfig, ClientError, ClientResult, DirectoryApi};
use crate::sync::messages::{GetDirectory, GetDirectoryResponse, MutationType, WorkspaceTreeUpdateBroadcast};
use crate::workspace::{normalize_path, parent_path, ROOT_PATH};

/// Outcome of [`FileTreeModelNetworkController::request_workspace_node`]
#[derive(Debug)]
pub enum NodeRequestResult {
    /// The node is loaded at this path
    Available(String),
    /// The server does not have it
    Unavailable,
    Error(ClientError),
}

pub struct FileTreeModelNetworkController<A> {
    model: FileTreeModel,
    api: A,
    fetch_depth: i32,
}

impl<A: DirectoryApi> FileTreeModelNetworkController<A> {
    pub fn new(api: A, config: &ClientConfig) -> Self {
        Self::with_model(FileTreeModel::new(), api, config)
    }

    pub fn with_model(model: FileTreeModel, api: A, config: &ClientConfig) -> Self {
        Self {
            model,
            api,
            fetch_depth: config.directory_fetch_depth,
        }
    }

    pub fn model(&self) -> &FileTreeModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut FileTreeModel {
        &mut self.model
    }

    /// Fetch and install the workspace root
    pub async fn load_root(&mut self) -> ClientResult<()> {
        self.reload_directory(ROOT_PATH).await
    }

    /// Make sure the node at `path` is loaded, fetching its directory if
    /// needed
    pub async fn request_workspace_node(&mut self, path: &str) -> NodeRequestResult {
        let path = normalize_path(path);

        if self.model.workspace_root().is_none() {
            if let Err(e) = self.load_root().await {
                return NodeRequestResult::Error(e);
            }
        }

        match self.model.find_closest_node(&path) {
            None => return NodeRequestResult::Unavailable,
            Some(closest) if closest.path == path => {
                return NodeRequestResult::Available(path);
            }
            Some(_) => {}
        }

        // Fetch the directory holding the node.
        let Some(dir_path) = parent_path(&path) else {
            return NodeRequestResult::Unavailable;
        };
        let response = match self.get_directory(&dir_path).await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to retrieve directory {}: {}", dir_path, e);
                return NodeRequestResult::Error(e);
            }
        };
        if response.base_directory.is_none() {
            // Deleted while the request was in flight
            return NodeRequestResult::Unavailable;
        }
        self.install(&response);

        if self.model.find_node(&path).is_some() {
            NodeRequestResult::Available(path)
        } else {
            NodeRequestResult::Unavailable
        }
    }

    /// Fetch the children of a loaded directory
    pub async fn request_directory_children(&mut self, path: &str) -> NodeRequestResult {
        let path = normalize_path(path);
        match self.model.find_node(&path) {
            Some(node) if node.is_directory() => {}
            Some(_) => {
                return NodeRequestResult::Error(ClientError::UnexpectedReply(format!(
                    "{} is not a directory",
                    path
                )))
            }
            None => return NodeRequestResult::Unavailable,
        }

        match self.get_directory(&path).await {
            Ok(response) if response.base_directory.is_some() => {
                self.install(&response);
                NodeRequestResult::Available(path)
            }
            Ok(_) => NodeRequestResult::Unavailable,
            Err(e) => {
                error!("Failed to retrieve children of {}: {}", path, e);
                NodeRequestResult::Error(e)
            }
        }
    }

    /// Entry point for tree broadcasts. A missing payload or a revision that
    /// does not directly follow the last applied one reloads the tree.
    pub async fn on_tree_update(
        &mut self,
        update: Option<WorkspaceTreeUpdateBroadcast>,
    ) -> ClientResult<()> {
        let Some(update) = update else {
            warn!("Tree update without payload, reloading");
            return self.on_file_tree_invalidated(ROOT_PATH).await;
        };

        let expected = self.model.last_applied_tree_mutation_revision() + 1;
        match update.new_tree_version.parse::<u64>() {
            Ok(version) if version == expected => self.handle_file_tree_mutation(&update).await,
            Ok(version) if version < expected => {
                debug!("Ignoring tree update {}; already at {}", version, expected - 1);
                Ok(())
            }
            _ => {
                warn!(
                    "Tree update {} does not follow {}, reloading",
                    update.new_tree_version,
                    expected - 1
                );
                self.on_file_tree_invalidated(ROOT_PATH).await
            }
        }
    }

    /// Apply every mutation of a broadcast, then move the revision forward
    pub async fn handle_file_tree_mutation(
        &mut self,
        update: &WorkspaceTreeUpdateBroadcast,
    ) -> ClientResult<()> {
        let revision = update.new_tree_version.as_str();

        for mutation in &update.mutations {
            if self.model.workspace_root().is_none() {
                // The next full load will include it.
                warn!(
                    "Dropping {:?} of {} received before the tree was loaded",
                    mutation.mutation_type, mutation.new_path
                );
                continue;
            }

            match mutation.mutation_type {
                MutationType::Add => {
                    let Some(info) = &mutation.new_node_info else {
                        warn!("ADD of {} without node info", mutation.new_path);
                        continue;
                    };
                    if self.model.find_node(&mutation.new_path).is_some() {
                        // Probably a placeholder created locally.
                        self.model.set_file_edit_session_key(
                            &mutation.new_path,
                            info.file_edit_session_key(),
                            revision,
                        );
                    } else {
                        self.model.add_node(&mutation.new_path, info, revision);
                    }
                }
                MutationType::Copy => match &mutation.new_node_info {
                    Some(info) => {
                        self.model.add_node(&mutation.new_path, info, revision);
                    }
                    None => warn!("COPY to {} without node info", mutation.new_path),
                },
                MutationType::Delete => {
                    self.model
                        .remove_nodes(std::slice::from_ref(&mutation.old_path), revision);
                }
                MutationType::Move => {
                    let outcome =
                        self.model
                            .move_node(&mutation.old_path, &mutation.new_path, revision);
                    if outcome == MoveOutcome::NeedsFetch {
                        if let NodeRequestResult::Error(e) =
                            self.request_workspace_node(&mutation.new_path).await
                        {
                            return Err(e);
                        }
                    }
                }
            }

            self.model.maybe_set_last_applied_tree_mutation_revision(revision);
        }

        self.model.maybe_set_last_applied_tree_mutation_revision(revision);
        Ok(())
    }

    /// Reload the part of the tree around `path`
    pub async fn on_file_tree_invalidated(&mut self, path: &str) -> ClientResult<()> {
        let mut path = normalize_path(path);

        if path != ROOT_PATH {
            if self.model.workspace_root().is_some() {
                match self.model.find_node(&path) {
                    // Not loaded, nothing to refresh
                    None => return Ok(()),
                    Some(node) if !node.is_directory() => {
                        path = parent_path(&path).unwrap_or_else(|| ROOT_PATH.to_string());
                    }
                    Some(_) => {}
                }
            } else {
                path = ROOT_PATH.to_string();
            }
        }

        self.reload_directory(&path).await
    }

    /// Install a fetched subtree. A root listing also resets the revision to
    /// the listing's.
    pub fn handle_subtree_replaced(&mut self, response: &GetDirectoryResponse) {
        self.install(response);
        if normalize_path(&response.path) == ROOT_PATH {
            self.model
                .maybe_set_last_applied_tree_mutation_revision(&response.root_id);
        }
    }

    async fn reload_directory(&mut self, path: &str) -> ClientResult<()> {
        match self.get_directory(path).await {
            Ok(response) => {
                self.handle_subtree_replaced(&response);
                Ok(())
            }
            Err(e) => {
                error!("Failed to refresh file tree at {}: {}", path, e);
                Err(e)
            }
        }
    }

    fn install(&mut self, response: &GetDirectoryResponse) {
        match &response.base_directory {
            Some(dir) => {
                self.model.replace_node(&response.path, dir, &response.root_id);
            }
            None => self
                .model
                .maybe_set_last_applied_tree_mutation_revision(&response.root_id),
        }
    }

    async fn get_directory(&self, path: &str) -> ClientResult<GetDirectoryResponse> {
        self.api
            .get_directory(GetDirectory {
                path: path.to_string(),
                depth: self.fetch_depth,
                root_id: self.model.last_applied_tree_mutation_revision().to_string(),
            })
            .await
    }
}
