//! Sled-based store for save metadata and the applied-op journal.
//!
//! Journal keys are `"{session_key}:{seq:020}"` so a prefix scan returns one
//! session's ops in revision order.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{ChangeRecord, DocumentMetadata, StorageConfig};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Path escapes the workspace: {0}")]
    InvalidPath(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_METADATA: &str = "documents";
const TREE_CHANGES: &str = "changes";

/// Sled-based store for session metadata and journaled ops
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<Db>,
    metadata: Tree,
    changes: Tree,
}

impl DocumentStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        Self::from_db(db)
    }

    /// Open a throwaway in-memory store
    pub fn temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let metadata = db.open_tree(TREE_METADATA)?;
        let changes = db.open_tree(TREE_CHANGES)?;
        Ok(Self {
            db: Arc::new(db),
            metadata,
            changes,
        })
    }

    /// Drop everything. Session keys are only stable for one server run.
    pub fn clear_journal(&self) -> StorageResult<()> {
        self.metadata.clear()?;
        self.changes.clear()?;
        Ok(())
    }

    /// Delete a session's metadata and journal
    pub fn delete_document(&self, session_key: &str) -> StorageResult<()> {
        self.metadata.remove(session_key.as_bytes())?;

        let prefix = journal_prefix(session_key);
        let mut to_remove = Vec::new();
        for item in self.changes.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            to_remove.push(key);
        }
        for key in to_remove {
            self.changes.remove(key)?;
        }

        Ok(())
    }

    /// Save document metadata
    pub fn save_metadata(&self, meta: &DocumentMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.session_key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load document metadata
    pub fn get_metadata(&self, session_key: &str) -> StorageResult<Option<DocumentMetadata>> {
        match self.metadata.get(session_key.as_bytes())? {
            Some(bytes) => {
                let meta: DocumentMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List metadata of every saved session
    pub fn list_documents(&self) -> StorageResult<Vec<DocumentMetadata>> {
        let mut docs = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            let meta: DocumentMetadata = bincode::deserialize(&value)?;
            docs.push(meta);
        }
        Ok(docs)
    }

    /// Journal an applied op
    pub fn save_change(&self, session_key: &str, change: &ChangeRecord) -> StorageResult<()> {
        let key = journal_key(session_key, change.seq);
        let bytes = bincode::serialize(change)?;
        self.changes.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Journal a batch of applied ops atomically
    pub fn save_changes(&self, session_key: &str, changes: &[ChangeRecord]) -> StorageResult<()> {
        let mut batch = sled::Batch::default();
        for change in changes {
            let key = journal_key(session_key, change.seq);
            batch.insert(key.as_bytes(), bincode::serialize(change)?);
        }
        self.changes.apply_batch(batch)?;
        Ok(())
    }

    /// Load journaled ops with `since_seq <= seq`
    pub fn load_changes_since(
        &self,
        session_key: &str,
        since_seq: u64,
    ) -> StorageResult<Vec<ChangeRecord>> {
        let start_key = journal_key(session_key, since_seq);
        let end_key = format!("{}~", journal_prefix(session_key)); // '~' is after digits in ASCII

        let mut changes = Vec::new();
        for item in self
            .changes
            .range(start_key.as_bytes()..end_key.as_bytes())
        {
            let (_, value) = item?;
            let change: ChangeRecord = bincode::deserialize(&value)?;
            changes.push(change);
        }
        Ok(changes)
    }

    /// Load journaled ops with `from_seq <= seq < to_seq`
    pub fn load_changes_range(
        &self,
        session_key: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> StorageResult<Vec<ChangeRecord>> {
        let start_key = journal_key(session_key, from_seq);
        let end_key = journal_key(session_key, to_seq);

        let mut changes = Vec::new();
        for item in self
            .changes
            .range(start_key.as_bytes()..end_key.as_bytes())
        {
            let (_, value) = item?;
            changes.push(bincode::deserialize(&value)?);
        }
        Ok(changes)
    }

    /// Latest journaled revision of a session, 0 if none
    pub fn get_latest_seq(&self, session_key: &str) -> StorageResult<u64> {
        let prefix = journal_prefix(session_key);

        if let Some(item) = self.changes.scan_prefix(prefix.as_bytes()).next_back() {
            let (key, _) = item?;
            let key_str = String::from_utf8_lossy(&key);
            if let Some(seq_str) = key_str.rsplit(':').next() {
                if let Ok(seq) = seq_str.parse::<u64>() {
                    return Ok(seq);
                }
            }
        }
        Ok(0)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
            metadata_count: self.metadata.len(),
            change_count: self.changes.len(),
        }
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub total_size_bytes: u64,
    pub metadata_count: usize,
    pub change_count: usize,
}

fn journal_prefix(session_key: &str) -> String {
    format!("{}:", session_key)
}

fn journal_key(session_key: &str, seq: u64) -> String {
    format!("{}:{:020}", session_key, seq)
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn change(seq: u64) -> ChangeRecord {
        ChangeRecord {
            seq,
            doc_op: format!(r#"[{{"retainLine":{}}}]"#, seq),
            timestamp: chrono::Utc::now().timestamp(),
            author_client_id: "client-1".to_string(),
        }
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let store = DocumentStore::open(config).unwrap();
        store.save_change("1", &change(1)).unwrap();
        store.flush().unwrap();
        assert_eq!(store.stats().change_count, 1);
    }

    #[test]
    fn test_metadata_save_load() {
        let store = DocumentStore::temporary().unwrap();
        let meta = DocumentMetadata::new("5", "/notes.txt").with_revision(3);

        store.save_metadata(&meta).unwrap();
        let loaded = store.get_metadata("5").unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert!(store.get_metadata("6").unwrap().is_none());
        assert_eq!(store.list_documents().unwrap().len(), 1);
    }

    #[test]
    fn test_changes() {
        let store = DocumentStore::temporary().unwrap();

        for i in 1..=5 {
            store.save_change("doc", &change(i)).unwrap();
        }
        store.save_change("doc-2", &change(9)).unwrap();

        let changes = store.load_changes_since("doc", 3).unwrap();
        assert_eq!(changes.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![3, 4, 5]);

        let range = store.load_changes_range("doc", 2, 4).unwrap();
        assert_eq!(range.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![2, 3]);

        assert_eq!(store.get_latest_seq("doc").unwrap(), 5);
        assert_eq!(store.get_latest_seq("missing").unwrap(), 0);
    }

    #[test]
    fn test_batch_save() {
        let store = DocumentStore::temporary().unwrap();
        let batch: Vec<_> = (1..=10).map(change).collect();
        store.save_changes("doc", &batch).unwrap();

        let all = store.load_changes_since("doc", 0).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all.first().map(|c| c.seq), Some(1));
        assert_eq!(store.get_latest_seq("doc").unwrap(), 10);
    }

    #[test]
    fn test_delete_and_clear() {
        let store = DocumentStore::temporary().unwrap();
        store.save_metadata(&DocumentMetadata::new("a", "/a")).unwrap();
        store.save_change("a", &change(1)).unwrap();
        store.save_metadata(&DocumentMetadata::new("b", "/b")).unwrap();

        store.delete_document("a").unwrap();
        assert!(store.get_metadata("a").unwrap().is_none());
        assert!(store.load_changes_since("a", 0).unwrap().is_empty());

        store.clear_journal().unwrap();
        assert!(store.list_documents().unwrap().is_empty());
    }
}
