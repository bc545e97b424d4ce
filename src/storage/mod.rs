//! Storage module for saved file contents and the applied-op journal.
//!
//! File contents live on disk under the workspace root and are reached
//! through the [`FileStore`] trait. A Sled database keeps per-session save
//! metadata and a journal of applied DocOps that backs recovery requests
//! reaching further back than the in-memory history.

mod files;
mod sled_store;

pub use files::{DiskStore, FileStore};
pub use sled_store::{DocumentStore, StorageError, StorageResult, StorageStats};

use serde::{Deserialize, Serialize};

/// Save metadata for one edit session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// File edit session key
    pub session_key: String,
    /// Workspace path the contents were last written to
    pub path: String,
    /// Unix timestamp of the first save
    pub created_at: i64,
    /// Unix timestamp of the last save
    pub updated_at: i64,
    /// Revision the saved contents reflect
    pub last_saved_cc_revision: u64,
    /// Size of the saved contents in bytes
    pub size_bytes: u64,
    /// Hex SHA-256 of the saved contents
    pub sha256: String,
}

impl DocumentMetadata {
    pub fn new(session_key: impl Into<String>, path: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            session_key: session_key.into(),
            path: path.into(),
            created_at: now,
            updated_at: now,
            last_saved_cc_revision: 0,
            size_bytes: 0,
            sha256: String::new(),
        }
    }

    pub fn with_revision(mut self, cc_revision: u64) -> Self {
        self.last_saved_cc_revision = cc_revision;
        self
    }

    pub fn with_contents(mut self, size_bytes: u64, sha256: impl Into<String>) -> Self {
        self.size_bytes = size_bytes;
        self.sha256 = sha256.into();
        self
    }
}

/// One applied DocOp in the journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Revision the op produced
    pub seq: u64,
    /// Serialized DocOp (JSON)
    pub doc_op: String,
    /// Timestamp when the change was recorded
    pub timestamp: i64,
    /// Client that made the change
    pub author_client_id: String,
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/collab.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_creation() {
        let meta = DocumentMetadata::new("12", "/src/main.rs")
            .with_revision(7)
            .with_contents(42, "abc123");

        assert_eq!(meta.session_key, "12");
        assert_eq!(meta.path, "/src/main.rs");
        assert_eq!(meta.last_saved_cc_revision, 7);
        assert_eq!(meta.size_bytes, 42);
        assert!(meta.created_at > 0);
    }

    #[test]
    fn test_storage_config_builder() {
        let config = StorageConfig::new("/tmp/db").with_flush_interval_ms(0);
        assert_eq!(config.path, "/tmp/db");
        assert_eq!(config.flush_interval_ms, 0);
        assert_eq!(config.cache_size, 256 * 1024 * 1024);
    }
}
