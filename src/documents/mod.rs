//! Server-side document engine.
//!
//! This module provides:
//! - [`VersionedDocument`]: a text document with a revision counter and the
//!   applied-op history used to transform late client ops
//! - [`FileEditSession`]: one open file, its participants and save state
//! - [`EditSessions`]: the registry that routes DocOp traffic, answers
//!   recovery requests and saves dirty sessions

mod edit_sessions;
mod file_edit_session;
mod versioned_document;

pub use edit_sessions::EditSessions;
pub use file_edit_session::{FileEditSession, SaveSnapshot};
pub use versioned_document::{AppliedDocOp, ConsumeResult, VersionedDocument, VersionedText};

use std::time::Duration;

use crate::ot::OtError;
use crate::storage::StorageError;
use crate::sync::protocol::ErrorCode;

/// Errors raised while consuming ops or serving sessions
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The op could not be parsed, transformed or applied
    #[error("Document operation failed: {0}")]
    DocumentOperation(String),

    #[error("Revision {requested} is no longer available (oldest retained: {oldest})")]
    HistoryUnavailable { requested: u64, oldest: u64 },

    #[error("Edit session is closed: {0}")]
    SessionClosed(String),

    #[error("Edit session not found: {0}")]
    SessionNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<OtError> for DocumentError {
    fn from(err: OtError) -> Self {
        DocumentError::DocumentOperation(err.to_string())
    }
}

impl DocumentError {
    /// Wire error code for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            DocumentError::DocumentOperation(_) => ErrorCode::DocumentOperation,
            DocumentError::HistoryUnavailable { .. } => ErrorCode::HistoryUnavailable,
            DocumentError::SessionClosed(_) | DocumentError::SessionNotFound(_) => {
                ErrorCode::SessionNotFound
            }
            DocumentError::FileNotFound(_) => ErrorCode::FileNotFound,
            DocumentError::Storage(_) => ErrorCode::ServerError,
        }
    }
}

/// Result type for document operations
pub type DocumentResult<T> = Result<T, DocumentError>;

/// Configuration for edit sessions
#[derive(Debug, Clone)]
pub struct EditSessionsConfig {
    /// How often dirty sessions are written out
    pub save_interval: Duration,
    /// Applied ops kept in memory per session
    pub max_history: usize,
}

impl Default for EditSessionsConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_millis(1500),
            max_history: 1000,
        }
    }
}

impl EditSessionsConfig {
    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err: DocumentError = OtError::ApplyMismatch("x".to_string()).into();
        assert_eq!(err.code(), ErrorCode::DocumentOperation);
        assert_eq!(
            DocumentError::HistoryUnavailable {
                requested: 2,
                oldest: 5
            }
            .code(),
            ErrorCode::HistoryUnavailable
        );
    }

    #[test]
    fn test_config_builder() {
        let config = EditSessionsConfig::default()
            .with_save_interval(Duration::from_millis(10))
            .with_max_history(0);
        assert_eq!(config.save_interval, Duration::from_millis(10));
        assert_eq!(config.max_history, 1);
    }
}
