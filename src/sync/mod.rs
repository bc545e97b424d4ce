//! Synchronization layer between collaborators and the server.
//!
//! This module provides:
//! - Message payloads for DocOps, recovery, directory listings and tree updates
//! - Binary WebSocket protocol with a JSON text fallback
//! - The connected-client registry used for broadcasts
//! - The server context that dispatches client messages

pub mod messages;
pub mod participants;
pub mod protocol;
pub mod server;

pub use participants::{Participants, PeerConnection};
pub use server::{SyncServer, SyncServerConfig};

use serde::{Deserialize, Serialize};

/// Unique identifier for a connected client
pub type ClientId = String;

/// Key of a file edit session. It is the workspace resource id of the file.
pub type FileEditSessionKey = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while routing messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncError {
    /// Edit session not found
    SessionNotFound(FileEditSessionKey),
    /// Client not connected
    ClientNotFound(ClientId),
    /// Invalid message
    InvalidMessage(String),
    /// Storage operation failed
    StorageError(String),
    /// Connection error
    ConnectionError(String),
    /// Authorization error
    Unauthorized(String),
    /// Internal server error
    Internal(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::SessionNotFound(key) => write!(f, "Edit session not found: {}", key),
            SyncError::ClientNotFound(id) => write!(f, "Client not found: {}", id),
            SyncError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            SyncError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            SyncError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            SyncError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            SyncError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<crate::storage::StorageError> for SyncError {
    fn from(err: crate::storage::StorageError) -> Self {
        SyncError::StorageError(err.to_string())
    }
}
