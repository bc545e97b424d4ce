//! Client side of the collaboration protocol.
//!
//! This module provides:
//! - [`Reorderer`]: releases revision-tagged items in order, with a gap timeout
//! - [`DocOpReceiver`] and [`DocOpRecoverer`]: in-order application of server
//!   ops and recovery of missed ones
//! - [`LocalDocument`]: the local text, unacknowledged edits and revision
//! - [`CollaborationSession`]: the per-file actor that ties them together
//! - [`FileTreeModel`] and [`FileTreeModelNetworkController`]: the lazily
//!   loaded mirror of the workspace tree
//! - [`transport::SyncClient`]: the websocket connection

mod file_tree_model;
mod local_document;
mod receiver;
mod recoverer;
mod reorderer;
mod revision;
mod session;
mod tree_controller;
pub mod transport;

pub use file_tree_model::{FileTreeModel, FileTreeNode, MoveOutcome, NodeId, TreeModelChange};
pub use local_document::LocalDocument;
pub use receiver::DocOpReceiver;
pub use recoverer::{DocOpRecoverer, RetryDecision};
pub use reorderer::Reorderer;
pub use revision::{DocOpSink, LastClientToServerDocOpProvider, RevisionProvider};
pub use session::{CollaborationSession, CollaborationSessionHandle, SessionEvent};
pub use tree_controller::{FileTreeModelNetworkController, NodeRequestResult};

use std::time::Duration;

use async_trait::async_trait;

use crate::ot::OtError;
use crate::sync::messages::{
    ClientToServerDocOp, GetDirectory, GetDirectoryResponse, RecoverFromMissedDocOps,
    RecoverFromMissedDocOpsResponse, ServerToClientDocOps,
};
use crate::sync::protocol::{ErrorCode, ProtocolError};

/// Errors surfaced by client components
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request never got an answer (connection lost, timed out)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server refused access. Never retried.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The server answered with an error
    #[error("Server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Document error: {0}")]
    Document(#[from] OtError),

    /// The reply did not match the request
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Connection closed")]
    Closed,
}

impl ClientError {
    /// Build the error for a server error reply
    pub fn from_server(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::Unauthorized => ClientError::Unauthorized(message),
            code => ClientError::Server { code, message },
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClientError::Unauthorized(_))
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Client tuning knobs
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a revision gap may stay open before recovery starts
    pub reorder_timeout: Duration,
    /// Recovery attempts before giving up
    pub max_recovery_attempts: u32,
    /// Delay between recovery attempts
    pub recovery_retry_delay: Duration,
    /// Depth used for directory fetches
    pub directory_fetch_depth: i32,
    /// How long a request waits for its reply
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reorder_timeout: Duration::from_secs(5),
            max_recovery_attempts: 5,
            recovery_retry_delay: Duration::from_secs(5),
            directory_fetch_depth: 2,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn with_reorder_timeout(mut self, timeout: Duration) -> Self {
        self.reorder_timeout = timeout;
        self
    }

    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    pub fn with_recovery_retry_delay(mut self, delay: Duration) -> Self {
        self.recovery_retry_delay = delay;
        self
    }

    pub fn with_directory_fetch_depth(mut self, depth: i32) -> Self {
        self.directory_fetch_depth = depth;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Sends local edits to the server
#[async_trait]
pub trait DocOpApi: Send + Sync {
    async fn mutate_document(&self, message: ClientToServerDocOp)
        -> ClientResult<ServerToClientDocOps>;
}

/// Asks the server for ops a client missed
#[async_trait]
pub trait RecoveryApi: Send + Sync {
    async fn recover_missed_doc_ops(
        &self,
        message: RecoverFromMissedDocOps,
    ) -> ClientResult<RecoverFromMissedDocOpsResponse>;
}

/// Fetches directory listings
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn get_directory(&self, message: GetDirectory) -> ClientResult<GetDirectoryResponse>;
}

#[async_trait]
impl<T: DirectoryApi + ?Sized> DirectoryApi for std::sync::Arc<T> {
    async fn get_directory(&self, message: GetDirectory) -> ClientResult<GetDirectoryResponse> {
        (**self).get_directory(message).await
    }
}
