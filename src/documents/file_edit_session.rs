//! A single open file shared by its participants.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use super::versioned_document::{AppliedDocOp, ConsumeResult, VersionedDocument, VersionedText};
use super::{DocumentError, DocumentResult};
use crate::ot::{DocOp, DocumentSelection};
use crate::sync::{ClientId, FileEditSessionKey};

/// Everything the save sweep needs, taken under the document lock
#[derive(Debug, Clone)]
pub struct SaveSnapshot {
    pub path: String,
    pub text: String,
    pub cc_revision: u64,
    pub size_bytes: u64,
    pub sha256: String,
    /// Applied ops not yet written to the journal
    pub unjournaled: Vec<(u64, AppliedDocOp)>,
}

struct SessionState {
    document: VersionedDocument,
    last_saved_cc_revision: u64,
    last_mutation_cc_revision: u64,
    last_journaled_cc_revision: u64,
    content_hash: Option<(u64, String)>,
}

impl SessionState {
    fn size_and_sha256(&mut self) -> (u64, String) {
        if let Some(cached) = &self.content_hash {
            return cached.clone();
        }
        let text = self.document.as_text().text;
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        let computed = (text.len() as u64, digest);
        self.content_hash = Some(computed.clone());
        computed
    }
}

pub struct FileEditSession {
    key: FileEditSessionKey,
    path: RwLock<String>,
    state: Mutex<SessionState>,
    participants: Mutex<HashSet<ClientId>>,
    closed: AtomicBool,
}

impl FileEditSession {
    pub fn new(
        key: impl Into<FileEditSessionKey>,
        path: impl Into<String>,
        contents: &str,
        max_history: usize,
    ) -> Self {
        Self {
            key: key.into(),
            path: RwLock::new(path.into()),
            state: Mutex::new(SessionState {
                document: VersionedDocument::new(contents, max_history),
                last_saved_cc_revision: 0,
                last_mutation_cc_revision: 0,
                last_journaled_cc_revision: 0,
                content_hash: None,
            }),
            participants: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path the file currently lives at
    pub fn path(&self) -> String {
        self.path.read().clone()
    }

    pub fn set_path(&self, path: impl Into<String>) {
        *self.path.write() = path.into();
    }

    pub fn consume(
        &self,
        doc_ops: &[DocOp],
        author_client_id: &str,
        intended_cc_revision: u64,
        selection: Option<DocumentSelection>,
    ) -> DocumentResult<Option<ConsumeResult>> {
        if self.is_closed() {
            return Err(DocumentError::SessionClosed(self.key.clone()));
        }

        let mut state = self.state.lock();
        let result = state.document.consume(
            doc_ops,
            author_client_id,
            intended_cc_revision,
            selection,
        )?;
        if result.is_some() {
            state.last_mutation_cc_revision = state.document.cc_revision();
            state.content_hash = None;
        }
        Ok(result)
    }

    pub fn cc_revision(&self) -> u64 {
        self.state.lock().document.cc_revision()
    }

    pub fn contents(&self) -> VersionedText {
        self.state.lock().document.as_text()
    }

    pub fn get_applied_doc_ops(&self, starting_revision: u64) -> BTreeMap<u64, AppliedDocOp> {
        self.state
            .lock()
            .document
            .get_applied_doc_ops(starting_revision)
    }

    pub fn oldest_retained_revision(&self) -> u64 {
        self.state.lock().document.oldest_retained_revision()
    }

    pub fn backfill_history(&self, ops: Vec<(u64, AppliedDocOp)>) -> usize {
        self.state.lock().document.backfill_history(ops)
    }

    /// True when there are applied ops that were not saved yet
    pub fn has_changes(&self) -> bool {
        let state = self.state.lock();
        state.last_mutation_cc_revision > state.last_saved_cc_revision
    }

    /// Size in bytes and hex SHA-256 of the current contents
    pub fn size_and_sha256(&self) -> (u64, String) {
        self.state.lock().size_and_sha256()
    }

    pub fn snapshot(&self) -> SaveSnapshot {
        let path = self.path();
        let mut state = self.state.lock();
        let (size_bytes, sha256) = state.size_and_sha256();
        let unjournaled = state
            .document
            .get_applied_doc_ops(state.last_journaled_cc_revision + 1)
            .into_iter()
            .collect();
        let VersionedText { cc_revision, text } = state.document.as_text();

        SaveSnapshot {
            path,
            text,
            cc_revision,
            size_bytes,
            sha256,
            unjournaled,
        }
    }

    /// Record that the contents at `cc_revision` reached storage
    pub fn mark_saved(&self, cc_revision: u64) {
        let mut state = self.state.lock();
        state.last_saved_cc_revision = state.last_saved_cc_revision.max(cc_revision);
        state.last_journaled_cc_revision = state.last_journaled_cc_revision.max(cc_revision);
    }

    /// Returns true if the client was not a participant yet
    pub fn add_participant(&self, client_id: &str) -> bool {
        self.participants.lock().insert(client_id.to_string())
    }

    pub fn remove_participant(&self, client_id: &str) -> bool {
        self.participants.lock().remove(client_id)
    }

    pub fn participants(&self) -> Vec<ClientId> {
        self.participants.lock().iter().cloned().collect()
    }

    pub fn has_participants(&self) -> bool {
        !self.participants.lock().is_empty()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
