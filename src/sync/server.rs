//! SyncServer: the per-process context every connection talks to.
//!
//! This module ties together:
//! - the connected-client registry used for broadcasts
//! - the edit sessions that apply and relay DocOps
//! - the workspace tree that serves listings and applies tree mutations
//!
//! Each decoded client message goes through [`SyncServer::handle_message`],
//! which returns the direct reply (if any). Broadcasts to other clients are
//! sent through their channels as a side effect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{GetDirectoryResponse, WorkspaceTreeUpdate, WorkspaceTreeUpdateBroadcast};
use super::participants::Participants;
use super::protocol::{ClientMessage, ErrorCode, ServerMessage, SyncProtocol, PROTOCOL_VERSION};
use super::{ClientId, SyncResult};
use crate::documents::{EditSessions, EditSessionsConfig};
use crate::storage::{DocumentMetadata, DocumentStore, FileStore};
use crate::workspace::WorkspaceTree;

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Document auto-save interval
    pub save_interval: Duration,
    /// Cleanup interval for stale connections
    pub cleanup_interval: Duration,
    /// Connections idle for longer than this are dropped
    pub session_timeout: Duration,
    /// Applied ops kept in memory per edit session
    pub max_history: usize,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_millis(1500),
            cleanup_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(300),
            max_history: 1000,
        }
    }
}

impl SyncServerConfig {
    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    fn edit_sessions_config(&self) -> EditSessionsConfig {
        EditSessionsConfig::default()
            .with_save_interval(self.save_interval)
            .with_max_history(self.max_history)
    }
}

/// The main synchronization server
pub struct SyncServer {
    /// Server configuration
    config: SyncServerConfig,
    /// Connected clients
    participants: Arc<Participants>,
    /// Open file edit sessions
    sessions: EditSessions,
    /// Authoritative workspace tree
    tree: Arc<RwLock<WorkspaceTree>>,
    /// Journal and save metadata
    storage: Option<Arc<DocumentStore>>,
    /// Server start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create a new sync server
    pub fn new(
        tree: WorkspaceTree,
        files: Arc<dyn FileStore>,
        storage: Option<DocumentStore>,
        config: SyncServerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let participants = Arc::new(Participants::new());
        let tree = Arc::new(RwLock::new(tree));
        let storage = storage.map(Arc::new);
        let sessions = EditSessions::new(
            files,
            storage.clone(),
            participants.clone(),
            tree.clone(),
            config.edit_sessions_config(),
        );

        Self {
            config,
            participants,
            sessions,
            tree,
            storage,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn sessions(&self) -> &EditSessions {
        &self.sessions
    }

    pub fn participants(&self) -> &Arc<Participants> {
        &self.participants
    }

    /// Register a new connection and assign its client id
    pub fn connect(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> ClientId {
        let client_id = Uuid::new_v4().to_string();
        self.participants.register(&client_id, tx);
        info!("Client connected: {}", client_id);
        client_id
    }

    /// Drop a connection and leave every session it was part of
    pub async fn disconnect(&self, client_id: &str) {
        self.sessions.disconnect(client_id).await;
        if self.participants.unregister(client_id) {
            info!("Client disconnected: {}", client_id);
        }
    }

    /// Dispatch one client message. Returns the direct reply, if any.
    pub async fn handle_message(
        &self,
        client_id: &str,
        msg: ClientMessage,
    ) -> Option<ServerMessage> {
        self.participants.touch(client_id);

        match msg {
            ClientMessage::Hello {
                protocol_version,
                client_name,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Some(SyncProtocol::error_response(
                        None,
                        ErrorCode::VersionMismatch,
                        format!(
                            "Protocol version {} is not supported (server speaks {})",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    ));
                }
                self.participants.set_name(client_id, &client_name);
                debug!("Hello from {} ({})", client_id, client_name);
                Some(ServerMessage::Welcome {
                    protocol_version: PROTOCOL_VERSION,
                    client_id: client_id.to_string(),
                    server_time: chrono::Utc::now().timestamp_millis(),
                })
            }

            ClientMessage::Goodbye { reason } => {
                info!(
                    "Client {} said goodbye: {}",
                    client_id,
                    reason.as_deref().unwrap_or("no reason")
                );
                self.sessions.disconnect(client_id).await;
                Some(ServerMessage::Goodbye { reason: None })
            }

            ClientMessage::MutateDocument {
                request_id,
                message,
            } => Some(match self.sessions.mutate(client_id, &message) {
                Some(reply) => ServerMessage::DocOpsApplied {
                    request_id,
                    message: reply,
                },
                None => SyncProtocol::error_response(
                    Some(request_id),
                    ErrorCode::DocumentOperation,
                    format!(
                        "Ops for session {} at revision {} were not applied",
                        message.file_edit_session_key, message.cc_revision
                    ),
                ),
            }),

            ClientMessage::RecoverMissedDocOps {
                request_id,
                message,
            } => Some(match self.sessions.recover_missed_doc_ops(client_id, &message) {
                Ok(response) => ServerMessage::RecoveryResponse {
                    request_id,
                    message: response,
                },
                Err(e) => {
                    warn!("Recovery for {} failed: {}", client_id, e);
                    SyncProtocol::error_response(Some(request_id), e.code(), e.to_string())
                }
            }),

            ClientMessage::GetFileContents {
                request_id,
                message,
            } => Some(
                match self.sessions.get_file_contents(client_id, &message.path).await {
                    Ok(response) => ServerMessage::FileContents {
                        request_id,
                        message: response,
                    },
                    Err(e) => SyncProtocol::error_response(Some(request_id), e.code(), e.to_string()),
                },
            ),

            ClientMessage::CloseFile {
                file_edit_session_key,
            } => {
                self.sessions
                    .close_session(client_id, &file_edit_session_key)
                    .await;
                None
            }

            ClientMessage::GetDirectory {
                request_id,
                message,
            } => {
                let response = self.get_directory(&message.path, message.depth).await;
                Some(ServerMessage::Directory {
                    request_id,
                    message: response,
                })
            }

            ClientMessage::MutateWorkspaceTree {
                request_id,
                message,
            } => Some(self.mutate_workspace_tree(client_id, request_id, message).await),

            ClientMessage::Ping { timestamp } => Some(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp_millis(),
            }),

            ClientMessage::GetStats => {
                let stats = self.stats().await;
                Some(ServerMessage::Stats {
                    active_sessions: stats.active_sessions as u32,
                    connected_clients: stats.connected_clients as u32,
                    tree_version: stats.tree_version,
                    uptime_seconds: stats.uptime_seconds,
                })
            }
        }
    }

    /// Directory listing at the current tree version
    pub async fn get_directory(&self, path: &str, depth: i32) -> GetDirectoryResponse {
        self.tree.read().await.get_directory(path, depth)
    }

    async fn mutate_workspace_tree(
        &self,
        client_id: &str,
        request_id: u64,
        mut update: WorkspaceTreeUpdate,
    ) -> ServerMessage {
        // The connection id is the author, whatever the payload claims.
        update.author_client_id = client_id.to_string();

        let (applied, tree_version) = {
            let mut tree = self.tree.write().await;
            let applied = tree.apply_mutations(&update).await;
            // Broadcast under the lock so other clients see versions in order.
            if let Some(broadcast) = &applied.broadcast {
                self.participants.broadcast_all(
                    client_id,
                    &ServerMessage::WorkspaceTreeBroadcast {
                        message: Some(broadcast.clone()),
                    },
                );
            }
            (applied, tree.tree_version())
        };

        if applied.broadcast.is_some() {
            self.sessions.refresh_paths().await;
        }

        match (applied.broadcast, applied.error) {
            (Some(broadcast), error) => {
                if let Some(e) = error {
                    warn!(
                        "Tree update from {} applied partially ({} mutations): {}",
                        client_id,
                        broadcast.mutations.len(),
                        e
                    );
                }
                ServerMessage::WorkspaceTreeUpdated {
                    request_id,
                    message: broadcast,
                }
            }
            (None, Some(e)) => SyncProtocol::error_response(
                Some(request_id),
                ErrorCode::TreeMutationFailed,
                e.to_string(),
            ),
            (None, None) => ServerMessage::WorkspaceTreeUpdated {
                request_id,
                message: WorkspaceTreeUpdateBroadcast {
                    author_client_id: client_id.to_string(),
                    mutations: Vec::new(),
                    new_tree_version: tree_version.to_string(),
                },
            },
        }
    }

    /// Save metadata of every document saved this run
    pub fn list_saved_documents(&self) -> SyncResult<Vec<DocumentMetadata>> {
        match &self.storage {
            Some(storage) => Ok(storage.list_documents()?),
            None => Ok(Vec::new()),
        }
    }

    /// Save dirty documents to storage
    pub async fn save_dirty_documents(&self) -> usize {
        self.sessions.save_dirty_sessions().await
    }

    /// Drop connections that went quiet
    pub async fn cleanup(&self) {
        for client_id in self.participants.stale_clients(self.config.session_timeout) {
            warn!("Removing stale client: {}", client_id);
            self.disconnect(&client_id).await;
        }
    }

    /// Get server statistics
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.sessions.session_count(),
            connected_clients: self.participants.len(),
            tree_version: self.tree.read().await.tree_version(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Start background tasks (save loop, cleanup loop)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let save_interval = server.config.save_interval;
        let mut shutdown = server.shutdown_receiver();

        // Save task
        let save_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(save_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = server.save_dirty_documents().await;
                        if saved > 0 {
                            debug!("Auto-saved {} documents", saved);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Save task shutting down");
                        // Final save
                        server.save_dirty_documents().await;
                        if let Some(storage) = &server.storage {
                            let _ = storage.flush();
                        }
                        break;
                    }
                }
            }
        });

        let server = self.clone();
        let cleanup_interval = server.config.cleanup_interval;
        let mut shutdown = server.shutdown_receiver();

        // Cleanup task
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.cleanup().await;
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            save_task: save_handle,
            cleanup_task: cleanup_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub active_sessions: usize,
    pub connected_clients: usize,
    pub tree_version: u64,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub save_task: tokio::task::JoinHandle<()>,
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.save_task, self.cleanup_task);
    }
}
