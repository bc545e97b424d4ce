//! Registry of open file edit sessions.
//!
//! Routes DocOp traffic to the right session, relays applied ops to the
//! other participants, answers recovery requests (falling back to the
//! journal when the in-memory history no longer reaches far enough) and
//! writes dirty sessions out on the save sweep.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::file_edit_session::FileEditSession;
use super::versioned_document::{AppliedDocOp, ConsumeResult, VersionedText};
use super::{DocumentError, DocumentResult, EditSessionsConfig};
use crate::ot::{DocOp, DocumentSelection};
use crate::storage::{ChangeRecord, DocumentMetadata, DocumentStore, FileStore, StorageError};
use crate::sync::messages::{
    ClientToServerDocOp, GetFileContentsResponse, RecoverFromMissedDocOps,
    RecoverFromMissedDocOpsResponse, ServerToClientDocOp, ServerToClientDocOps,
};
use crate::sync::protocol::ServerMessage;
use crate::sync::{FileEditSessionKey, Participants};
use crate::workspace::{normalize_path, WorkspaceTree};

pub struct EditSessions {
    sessions: DashMap<FileEditSessionKey, Arc<FileEditSession>>,
    files: Arc<dyn FileStore>,
    journal: Option<Arc<DocumentStore>>,
    participants: Arc<Participants>,
    tree: Arc<RwLock<WorkspaceTree>>,
    config: EditSessionsConfig,
}

impl EditSessions {
    pub fn new(
        files: Arc<dyn FileStore>,
        journal: Option<Arc<DocumentStore>>,
        participants: Arc<Participants>,
        tree: Arc<RwLock<WorkspaceTree>>,
        config: EditSessionsConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            files,
            journal,
            participants,
            tree,
            config,
        }
    }

    pub fn config(&self) -> &EditSessionsConfig {
        &self.config
    }

    pub fn session(&self, key: &str) -> Option<Arc<FileEditSession>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a file for `client_id`, provisioning its session if needed.
    ///
    /// An open session is authoritative over the file on disk.
    pub async fn get_file_contents(
        &self,
        client_id: &str,
        path: &str,
    ) -> DocumentResult<GetFileContentsResponse> {
        let path = normalize_path(path);
        let key = {
            let tree = self.tree.read().await;
            match tree.node_by_path(&path) {
                Some(node) if !node.is_directory() => node.key.clone(),
                _ => return Err(DocumentError::FileNotFound(path)),
            }
        };

        let session = match self.session(&key) {
            Some(session) => session,
            None => {
                let contents = match self.files.read(&path).await {
                    Ok(contents) => contents,
                    Err(StorageError::NotFound(_)) => return Err(DocumentError::FileNotFound(path)),
                    Err(e) => return Err(e.into()),
                };
                self.sessions
                    .entry(key.clone())
                    .or_insert_with(|| {
                        info!("Opened edit session {} for {}", key, path);
                        Arc::new(FileEditSession::new(
                            key.clone(),
                            path.clone(),
                            &contents,
                            self.config.max_history,
                        ))
                    })
                    .value()
                    .clone()
            }
        };

        session.add_participant(client_id);
        let VersionedText { cc_revision, text } = session.contents();

        Ok(GetFileContentsResponse {
            path,
            file_edit_session_key: key,
            cc_revision,
            contents: text,
        })
    }

    /// Apply a client's ops and relay them to the other participants.
    ///
    /// Returns `None` when the message was dropped (unknown session,
    /// malformed or inapplicable op). A retry of ops that were already
    /// applied gets an empty reply.
    pub fn mutate(
        &self,
        client_id: &str,
        message: &ClientToServerDocOp,
    ) -> Option<ServerToClientDocOps> {
        let key = &message.file_edit_session_key;
        let session = match self.session(key) {
            Some(session) => session,
            None => {
                error!("Ops from {} for unknown edit session {}", client_id, key);
                return None;
            }
        };

        let doc_ops = match parse_doc_ops(&message.doc_ops) {
            Ok(doc_ops) => doc_ops,
            Err(e) => {
                error!("Dropping malformed ops from {} for {}: {}", client_id, key, e);
                return None;
            }
        };

        session.add_participant(client_id);
        match self.consume(
            &session,
            &doc_ops,
            client_id,
            message.cc_revision,
            message.selection.clone(),
        ) {
            Ok(Some(result)) => Some(ServerToClientDocOps {
                doc_ops: self.publish(&session, client_id, result),
            }),
            Ok(None) => Some(ServerToClientDocOps::default()),
            Err(e) => {
                error!(
                    "Failed to apply ops from {} to session {} at revision {}: {}",
                    client_id, key, message.cc_revision, e
                );
                None
            }
        }
    }

    /// Re-apply a client's unacknowledged ops, then hand back every op
    /// after `current_cc_revision` in order.
    pub fn recover_missed_doc_ops(
        &self,
        client_id: &str,
        message: &RecoverFromMissedDocOps,
    ) -> DocumentResult<RecoverFromMissedDocOpsResponse> {
        let key = &message.file_edit_session_key;
        let session = self
            .session(key)
            .ok_or_else(|| DocumentError::SessionNotFound(key.clone()))?;
        session.add_participant(client_id);

        if !message.doc_ops.is_empty() {
            // Resent ops that no longer apply are dropped; the client still
            // gets the ops it missed.
            let consumed = parse_doc_ops(&message.doc_ops).and_then(|doc_ops| {
                self.consume(
                    &session,
                    &doc_ops,
                    client_id,
                    message.current_cc_revision,
                    None,
                )
            });
            match consumed {
                Ok(Some(result)) => {
                    self.publish(&session, client_id, result);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "Dropping resent ops from {} for {} at revision {}: {}",
                        client_id, key, message.current_cc_revision, e
                    );
                }
            }
        }

        let start = message.current_cc_revision + 1;
        self.ensure_history(&session, start)?;

        let file_path = session.path();
        let doc_ops: Vec<ServerToClientDocOp> = session
            .get_applied_doc_ops(start)
            .into_iter()
            .map(|(revision, applied)| to_message(&session, &file_path, revision, applied, None))
            .collect();

        debug!(
            "Recovered {} ops after revision {} for {} in session {}",
            doc_ops.len(),
            message.current_cc_revision,
            client_id,
            key
        );
        Ok(RecoverFromMissedDocOpsResponse { doc_ops })
    }

    fn consume(
        &self,
        session: &FileEditSession,
        doc_ops: &[DocOp],
        author: &str,
        intended_cc_revision: u64,
        selection: Option<DocumentSelection>,
    ) -> DocumentResult<Option<ConsumeResult>> {
        match session.consume(doc_ops, author, intended_cc_revision, selection.clone()) {
            Err(DocumentError::HistoryUnavailable { requested, .. }) => {
                self.ensure_history(session, requested)?;
                session.consume(doc_ops, author, intended_cc_revision, selection)
            }
            other => other,
        }
    }

    /// Make sure the session's history reaches back to `start`, loading
    /// journaled ops if it does not.
    fn ensure_history(&self, session: &FileEditSession, start: u64) -> DocumentResult<()> {
        let oldest = session.oldest_retained_revision();
        if start >= oldest {
            return Ok(());
        }

        if let Some(journal) = &self.journal {
            let records = journal.load_changes_range(session.key(), start, oldest)?;
            let ops = records
                .into_iter()
                .map(|record| {
                    Ok((
                        record.seq,
                        AppliedDocOp {
                            doc_op: DocOp::from_json(&record.doc_op)?,
                            author_client_id: record.author_client_id,
                        },
                    ))
                })
                .collect::<DocumentResult<Vec<_>>>()?;
            let added = session.backfill_history(ops);
            debug!(
                "Loaded {} journaled ops for session {} starting at {}",
                added,
                session.key(),
                start
            );
        }

        let oldest = session.oldest_retained_revision();
        if start < oldest {
            return Err(DocumentError::HistoryUnavailable {
                requested: start,
                oldest,
            });
        }
        Ok(())
    }

    /// Turn a consume result into outgoing messages and broadcast them to
    /// every participant except `sender`.
    fn publish(
        &self,
        session: &FileEditSession,
        sender: &str,
        result: ConsumeResult,
    ) -> Vec<ServerToClientDocOp> {
        let file_path = session.path();
        let last = result.applied.len().saturating_sub(1);
        let mut selection = result.transformed_selection;

        let messages: Vec<ServerToClientDocOp> = result
            .applied
            .into_iter()
            .enumerate()
            .map(|(i, (revision, applied))| {
                let selection = if i == last { selection.take() } else { None };
                to_message(session, &file_path, revision, applied, selection)
            })
            .collect();

        let recipients = session.participants();
        for message in &messages {
            self.participants.broadcast_to(
                &recipients,
                sender,
                &ServerMessage::DocOpBroadcast {
                    message: message.clone(),
                },
            );
        }
        messages
    }

    /// Remove `client_id` from a session. A session nobody uses any more is
    /// saved and dropped.
    pub async fn close_session(&self, client_id: &str, key: &str) {
        let session = match self.session(key) {
            Some(session) => session,
            None => return,
        };
        session.remove_participant(client_id);
        if session.has_participants() {
            return;
        }

        if session.has_changes() {
            if let Err(e) = self.save_session(&session).await {
                error!("Failed to save session {} on close: {}", key, e);
                return;
            }
        }

        let removed = self
            .sessions
            .remove_if(key, |_, s| !s.has_participants() && !s.has_changes());
        if let Some((_, session)) = removed {
            session.close();
            info!("Closed edit session {} ({})", key, session.path());
        }
    }

    /// Leave every session `client_id` takes part in
    pub async fn disconnect(&self, client_id: &str) {
        let keys: Vec<FileEditSessionKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.participants().iter().any(|p| p == client_id))
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            self.close_session(client_id, &key).await;
        }
    }

    /// Drop a session without saving, used when its file was deleted
    pub fn remove_session(&self, key: &str) {
        if let Some((_, session)) = self.sessions.remove(key) {
            session.close();
            info!("Removed edit session {} ({})", key, session.path());
        }
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.delete_document(key) {
                warn!("Failed to delete journal for {}: {}", key, e);
            }
        }
    }

    /// Follow tree changes: sessions pick up their file's new path and
    /// sessions whose file is gone are removed.
    pub async fn refresh_paths(&self) {
        let mut removed = Vec::new();
        {
            let tree = self.tree.read().await;
            for entry in self.sessions.iter() {
                match tree.get(entry.key()) {
                    Some(node) if !node.is_directory() => {
                        if entry.path() != node.path {
                            debug!("Session {} moved to {}", entry.key(), node.path);
                            entry.set_path(node.path.clone());
                        }
                    }
                    _ => removed.push(entry.key().clone()),
                }
            }
        }

        for key in removed {
            self.remove_session(&key);
        }
    }

    /// Save every session with unsaved ops
    pub async fn save_dirty_sessions(&self) -> usize {
        let dirty: Vec<Arc<FileEditSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.has_changes())
            .map(|entry| entry.value().clone())
            .collect();

        let mut saved = 0;
        for session in dirty {
            match self.save_session(&session).await {
                Ok(()) => saved += 1,
                Err(e) => error!("Failed to save session {}: {}", session.key(), e),
            }
        }
        saved
    }

    async fn save_session(&self, session: &FileEditSession) -> DocumentResult<()> {
        let snapshot = session.snapshot();
        self.files.write(&snapshot.path, &snapshot.text).await?;

        if let Some(journal) = &self.journal {
            let timestamp = chrono::Utc::now().timestamp();
            let records = snapshot
                .unjournaled
                .iter()
                .map(|(revision, applied)| {
                    Ok(ChangeRecord {
                        seq: *revision,
                        doc_op: applied.doc_op.to_json()?,
                        timestamp,
                        author_client_id: applied.author_client_id.clone(),
                    })
                })
                .collect::<DocumentResult<Vec<_>>>()?;
            journal.save_changes(session.key(), &records)?;

            let mut meta = DocumentMetadata::new(session.key(), &snapshot.path)
                .with_revision(snapshot.cc_revision)
                .with_contents(snapshot.size_bytes, &snapshot.sha256);
            if let Some(existing) = journal.get_metadata(session.key())? {
                meta.created_at = existing.created_at;
            }
            journal.save_metadata(&meta)?;
        }

        self.tree
            .write()
            .await
            .set_file_size(session.key(), snapshot.size_bytes);
        session.mark_saved(snapshot.cc_revision);

        debug!(
            "Saved session {} to {} at revision {}",
            session.key(),
            snapshot.path,
            snapshot.cc_revision
        );
        Ok(())
    }
}

fn parse_doc_ops(serialized: &[String]) -> DocumentResult<Vec<DocOp>> {
    serialized
        .iter()
        .map(|json| DocOp::from_json(json).map_err(DocumentError::from))
        .collect()
}

fn to_message(
    session: &FileEditSession,
    file_path: &str,
    revision: u64,
    applied: AppliedDocOp,
    selection: Option<DocumentSelection>,
) -> ServerToClientDocOp {
    ServerToClientDocOp {
        file_edit_session_key: session.key().to_string(),
        client_id: applied.author_client_id,
        applied_cc_revision: revision,
        doc_op: applied.doc_op,
        selection,
        file_path: file_path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Document;
    use crate::storage::DiskStore;
    use crate::sync::messages::{Mutation, WorkspaceTreeUpdate};
    use crate::workspace::ScanOptions;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::mpsc;

    struct Fixture {
        dir: TempDir,
        sessions: EditSessions,
        participants: Arc<Participants>,
        tree: Arc<RwLock<WorkspaceTree>>,
        journal: Arc<DocumentStore>,
    }

    fn fixture(max_history: usize) -> Fixture {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello\nworld").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();

        let (tree, _) = WorkspaceTree::scan(dir.path(), &ScanOptions::default()).unwrap();
        let tree = Arc::new(RwLock::new(tree));
        let participants = Arc::new(Participants::new());
        let journal = Arc::new(DocumentStore::temporary().unwrap());
        let sessions = EditSessions::new(
            Arc::new(DiskStore::new(dir.path())),
            Some(journal.clone()),
            participants.clone(),
            tree.clone(),
            EditSessionsConfig::default().with_max_history(max_history),
        );

        Fixture {
            dir,
            sessions,
            participants,
            tree,
            journal,
        }
    }

    fn connect(
        participants: &Participants,
        client_id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        participants.register(client_id, tx);
        rx
    }

    fn message(key: &str, client_id: &str, cc_revision: u64, op: &DocOp) -> ClientToServerDocOp {
        ClientToServerDocOp {
            file_edit_session_key: key.to_string(),
            client_id: client_id.to_string(),
            cc_revision,
            selection: None,
            doc_ops: vec![op.to_json().unwrap()],
        }
    }

    #[tokio::test]
    async fn test_open_file() {
        let f = fixture(100);
        let response =
            tokio_test::assert_ok!(f.sessions.get_file_contents("a", "notes.txt").await);

        assert_eq!(response.path, "/notes.txt");
        assert_eq!(response.contents, "hello\nworld");
        assert_eq!(response.cc_revision, 0);
        assert_eq!(f.sessions.session_count(), 1);

        assert!(matches!(
            f.sessions.get_file_contents("a", "/missing.txt").await,
            Err(DocumentError::FileNotFound(_))
        ));
        assert!(matches!(
            f.sessions.get_file_contents("a", "/docs").await,
            Err(DocumentError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mutate_broadcasts_to_others() {
        let f = fixture(100);
        let mut rx_a = connect(&f.participants, "a");
        let mut rx_b = connect(&f.participants, "b");
        let key = f
            .sessions
            .get_file_contents("a", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;
        f.sessions.get_file_contents("b", "/notes.txt").await.unwrap();

        let op = Document::from_text("hello\nworld").insert_op(0, 5, "!").unwrap();
        let reply = f.sessions.mutate("a", &message(&key, "a", 0, &op)).unwrap();

        assert_eq!(reply.doc_ops.len(), 1);
        assert_eq!(reply.doc_ops[0].applied_cc_revision, 1);
        assert_eq!(reply.doc_ops[0].file_path, "/notes.txt");

        match rx_b.recv().await {
            Some(ServerMessage::DocOpBroadcast { message }) => {
                assert_eq!(message.client_id, "a");
                assert_eq!(message.applied_cc_revision, 1);
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_or_unknown_is_dropped() {
        let f = fixture(100);
        let key = f
            .sessions
            .get_file_contents("a", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;

        let mut bad = message(&key, "a", 0, &DocOp::default());
        bad.doc_ops = vec!["{not json".to_string()];
        assert!(f.sessions.mutate("a", &bad).is_none());

        let wrong = Document::from_text("nope").insert_op(0, 0, "x").unwrap();
        assert!(f.sessions.mutate("a", &message(&key, "a", 0, &wrong)).is_none());

        let op = Document::from_text("hello\nworld").insert_op(0, 0, "x").unwrap();
        assert!(f.sessions.mutate("a", &message("999", "a", 0, &op)).is_none());

        // The session is still usable after the bad input.
        let reply = f.sessions.mutate("a", &message(&key, "a", 0, &op)).unwrap();
        assert_eq!(reply.doc_ops[0].applied_cc_revision, 1);
    }

    #[tokio::test]
    async fn test_retried_ops_get_empty_reply() {
        let f = fixture(100);
        let key = f
            .sessions
            .get_file_contents("a", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;
        let op = Document::from_text("hello\nworld").insert_op(0, 0, "x").unwrap();

        f.sessions.mutate("a", &message(&key, "a", 0, &op)).unwrap();
        let retry = f.sessions.mutate("a", &message(&key, "a", 0, &op)).unwrap();
        assert!(retry.doc_ops.is_empty());
        assert_eq!(f.sessions.session(&key).unwrap().cc_revision(), 1);
    }

    #[tokio::test]
    async fn test_recovery_returns_missed_ops_in_order() {
        let f = fixture(100);
        let key = f
            .sessions
            .get_file_contents("w", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;

        let mut local = Document::from_text("hello\nworld");
        for i in 0..5u64 {
            let op = local.insert_op(1, 5 + i as usize, "!").unwrap();
            local.apply(&op).unwrap();
            f.sessions.mutate("w", &message(&key, "w", i, &op)).unwrap();
        }

        // Another client and this one both edit against revision 5.
        let other = local.insert_op(0, 0, "C").unwrap();
        f.sessions.mutate("c", &message(&key, "c", 5, &other)).unwrap();
        let mine = local.insert_op(0, 5, "B").unwrap();
        f.sessions.mutate("b", &message(&key, "b", 5, &mine)).unwrap();

        // The reply to "b" was lost; it resends its op with recovery.
        let response = f
            .sessions
            .recover_missed_doc_ops(
                "b",
                &RecoverFromMissedDocOps {
                    file_edit_session_key: key.clone(),
                    client_id: "b".to_string(),
                    current_cc_revision: 5,
                    doc_ops: vec![mine.to_json().unwrap()],
                },
            )
            .unwrap();

        let summary: Vec<(u64, String)> = response
            .doc_ops
            .iter()
            .map(|op| (op.applied_cc_revision, op.client_id.clone()))
            .collect();
        assert_eq!(summary, vec![(6, "c".to_string()), (7, "b".to_string())]);

        let session = f.sessions.session(&key).unwrap();
        assert_eq!(session.cc_revision(), 7);
        assert_eq!(session.contents().text, "ChelloB\nworld!!!!!");
    }

    #[tokio::test]
    async fn test_recovery_drops_resent_ops_that_do_not_apply() {
        let f = fixture(100);
        let key = f
            .sessions
            .get_file_contents("a", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;

        let op = Document::from_text("hello\nworld").insert_op(0, 0, "x").unwrap();
        f.sessions.mutate("a", &message(&key, "a", 0, &op)).unwrap();

        let stale = Document::from_text("zzz").delete_op(0, 0, 1).unwrap();
        for resent in [stale.to_json().unwrap(), "{not json".to_string()] {
            let response = tokio_test::assert_ok!(f.sessions.recover_missed_doc_ops(
                "b",
                &RecoverFromMissedDocOps {
                    file_edit_session_key: key.clone(),
                    client_id: "b".to_string(),
                    current_cc_revision: 0,
                    doc_ops: vec![resent],
                },
            ));

            assert_eq!(response.doc_ops.len(), 1);
            assert_eq!(response.doc_ops[0].applied_cc_revision, 1);
            assert_eq!(response.doc_ops[0].client_id, "a");
        }

        let session = f.sessions.session(&key).unwrap();
        assert_eq!(session.cc_revision(), 1);
        assert_eq!(session.contents().text, "xhello\nworld");
    }

    #[tokio::test]
    async fn test_recovery_of_unknown_session() {
        let f = fixture(100);
        let err = f
            .sessions
            .recover_missed_doc_ops(
                "a",
                &RecoverFromMissedDocOps {
                    file_edit_session_key: "404".to_string(),
                    client_id: "a".to_string(),
                    current_cc_revision: 0,
                    doc_ops: Vec::new(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DocumentError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_recovery_reads_journal_past_memory_window() {
        let f = fixture(2);
        let key = f
            .sessions
            .get_file_contents("a", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;

        let mut local = Document::from_text("hello\nworld");
        for i in 0..4u64 {
            let op = local.insert_op(0, 0, "x").unwrap();
            local.apply(&op).unwrap();
            f.sessions.mutate("a", &message(&key, "a", i, &op)).unwrap();
            assert_eq!(f.sessions.save_dirty_sessions().await, 1);
        }
        assert_eq!(f.journal.get_latest_seq(&key).unwrap(), 4);

        let response = f
            .sessions
            .recover_missed_doc_ops(
                "b",
                &RecoverFromMissedDocOps {
                    file_edit_session_key: key.clone(),
                    client_id: "b".to_string(),
                    current_cc_revision: 0,
                    doc_ops: Vec::new(),
                },
            )
            .unwrap();
        let revisions: Vec<u64> = response
            .doc_ops
            .iter()
            .map(|op| op.applied_cc_revision)
            .collect();
        assert_eq!(revisions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_save_writes_file_and_metadata() {
        let f = fixture(100);
        let key = f
            .sessions
            .get_file_contents("a", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;
        let op = Document::from_text("hello\nworld").insert_op(1, 5, "!").unwrap();
        f.sessions.mutate("a", &message(&key, "a", 0, &op)).unwrap();

        assert_eq!(f.sessions.save_dirty_sessions().await, 1);
        assert_eq!(f.sessions.save_dirty_sessions().await, 0);

        let on_disk = std::fs::read_to_string(f.dir.path().join("notes.txt")).unwrap();
        assert_eq!(on_disk, "hello\nworld!");

        let meta = f.journal.get_metadata(&key).unwrap().unwrap();
        assert_eq!(meta.last_saved_cc_revision, 1);
        assert_eq!(meta.size_bytes, 12);
        assert_eq!(f.tree.read().await.get(&key).unwrap().size, 12);
    }

    #[tokio::test]
    async fn test_close_saves_and_drops_session() {
        let f = fixture(100);
        let key = f
            .sessions
            .get_file_contents("a", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;
        f.sessions.get_file_contents("b", "/notes.txt").await.unwrap();
        let op = Document::from_text("hello\nworld").insert_op(0, 0, ">").unwrap();
        f.sessions.mutate("a", &message(&key, "a", 0, &op)).unwrap();

        f.sessions.close_session("a", &key).await;
        assert_eq!(f.sessions.session_count(), 1);

        f.sessions.disconnect("b").await;
        assert_eq!(f.sessions.session_count(), 0);
        let on_disk = std::fs::read_to_string(f.dir.path().join("notes.txt")).unwrap();
        assert_eq!(on_disk, ">hello\nworld");
    }

    #[tokio::test]
    async fn test_refresh_paths_follows_tree() {
        let f = fixture(100);
        let key = f
            .sessions
            .get_file_contents("a", "/notes.txt")
            .await
            .unwrap()
            .file_edit_session_key;

        let update = WorkspaceTreeUpdate {
            author_client_id: "a".to_string(),
            mutations: vec![Mutation::moved("/notes.txt", "/docs/notes.txt")],
        };
        assert!(f.tree.write().await.apply_mutations(&update).await.error.is_none());
        f.sessions.refresh_paths().await;
        assert_eq!(f.sessions.session(&key).unwrap().path(), "/docs/notes.txt");

        let update = WorkspaceTreeUpdate {
            author_client_id: "a".to_string(),
            mutations: vec![Mutation::delete("/docs")],
        };
        assert!(f.tree.write().await.apply_mutations(&update).await.error.is_none());
        f.sessions.refresh_paths().await;
        assert!(f.sessions.session(&key).is_none());
    }
}
