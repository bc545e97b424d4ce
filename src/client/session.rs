//! Per-file collaboration actor.
//!
//! A [`CollaborationSession`] owns the local document, the receiver and the
//! recoverer of one edit session and runs them on a single tokio task:
//!
//! ```text
//!   handle.edit() ──▶ ┌──────────────────────────────┐ ──▶ DocOpApi
//!   broadcasts   ──▶ │ LocalDocument                │ ──▶ RecoveryApi
//!                     │ DocOpReceiver / Recoverer    │
//!   SessionEvent ◀── └──────────────────────────────┘
//! ```
//!
//! Requests to the server run as futures polled by the same `select!` loop,
//! so broadcasts keep flowing while a mutation or recovery is in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::local_document::LocalDocument;
use super::receiver::DocOpReceiver;
use super::recoverer::{DocOpRecoverer, RetryDecision};
use super::revision::RevisionProvider;
use super::{ClientConfig, ClientError, ClientResult, DocOpApi, RecoveryApi};
use crate::ot::{DocOp, DocumentSelection};
use crate::sync::messages::{
    RecoverFromMissedDocOps, RecoverFromMissedDocOpsResponse, ServerToClientDocOp,
    ServerToClientDocOps,
};
use crate::sync::{ClientId, FileEditSessionKey};

type Pending<T> = Pin<Box<dyn Future<Output = ClientResult<T>> + Send>>;

/// Things the owner of a session is told about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An op reached the local document at `revision`
    DocOpApplied {
        revision: u64,
        client_id: ClientId,
        selection: Option<DocumentSelection>,
        /// The op was this client's own edit coming back
        is_local: bool,
    },
    /// Recovery gave up. The document may be stale until it is reopened.
    RecoveryFailed {
        key: FileEditSessionKey,
        error: String,
    },
    Closed { key: FileEditSessionKey },
}

enum SessionCommand {
    Edit {
        op: DocOp,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    SetSelection(Option<DocumentSelection>),
    Snapshot {
        reply: oneshot::Sender<(u64, String)>,
    },
    Recover,
    Close,
}

/// Handle to a running session
pub struct CollaborationSessionHandle {
    key: FileEditSessionKey,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl CollaborationSessionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Apply a local edit made against the current local text
    pub async fn edit(&self, op: DocOp) -> ClientResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Edit { op, reply })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub fn set_selection(&self, selection: Option<DocumentSelection>) -> ClientResult<()> {
        self.commands
            .send(SessionCommand::SetSelection(selection))
            .map_err(|_| ClientError::Closed)
    }

    /// Current revision and text
    pub async fn snapshot(&self) -> ClientResult<(u64, String)> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Snapshot { reply })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Ask for missed ops now, for example after a reconnect
    pub fn recover(&self) -> ClientResult<()> {
        self.commands
            .send(SessionCommand::Recover)
            .map_err(|_| ClientError::Closed)
    }

    /// Stop the session and wait for its task
    pub async fn close(self) {
        let _ = self.commands.send(SessionCommand::Close);
        let _ = self.task.await;
    }
}

pub struct CollaborationSession<A> {
    document: LocalDocument,
    receiver: DocOpReceiver,
    recoverer: DocOpRecoverer,
    api: Arc<A>,
}

impl<A> CollaborationSession<A>
where
    A: DocOpApi + RecoveryApi + 'static,
{
    pub fn new(api: Arc<A>, document: LocalDocument, config: &ClientConfig) -> Self {
        let mut receiver = DocOpReceiver::new(document.key(), config.reorder_timeout);
        receiver.connect(document.revision());
        let recoverer = DocOpRecoverer::new(document.key(), document.client_id(), config);

        Self {
            document,
            receiver,
            recoverer,
            api,
        }
    }

    /// Run the session on its own task. `incoming` carries the broadcasts for
    /// this edit session.
    pub fn spawn(
        self,
        incoming: mpsc::UnboundedReceiver<ServerToClientDocOp>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> CollaborationSessionHandle {
        let key = self.document.key().to_string();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(incoming, commands_rx, events));

        CollaborationSessionHandle {
            key,
            commands: commands_tx,
            task,
        }
    }

    async fn run(
        mut self,
        mut incoming: mpsc::UnboundedReceiver<ServerToClientDocOp>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) {
        let key = self.document.key().to_string();
        info!("Collaboration session started for {}", key);

        let mut mutation: Option<Pending<ServerToClientDocOps>> = None;
        let mut recovery: Option<Pending<RecoverFromMissedDocOpsResponse>> = None;

        loop {
            let deadline = self.receiver.deadline();

            tokio::select! {
                message = incoming.recv() => match message {
                    Some(message) => {
                        let applied = self.receiver.on_doc_op_received(&mut self.document, message);
                        self.emit(&events, applied);
                    }
                    None => {
                        debug!("Broadcast channel for {} closed", key);
                        break;
                    }
                },

                command = commands.recv() => match command {
                    Some(SessionCommand::Edit { op, reply }) => {
                        let _ = reply.send(self.document.apply_local(op));
                    }
                    Some(SessionCommand::SetSelection(selection)) => {
                        self.document.set_selection(selection);
                    }
                    Some(SessionCommand::Snapshot { reply }) => {
                        let _ = reply.send((self.document.revision(), self.document.text()));
                    }
                    Some(SessionCommand::Recover) => {
                        if recovery.is_none() {
                            recovery = self.start_recovery();
                        }
                    }
                    Some(SessionCommand::Close) | None => break,
                },

                _ = wait_until(deadline) => {
                    if let Some(last) = self.receiver.poll_timeout(Instant::now()) {
                        warn!("Missing op after revision {} for {}, recovering", last, key);
                        if recovery.is_none() {
                            recovery = self.start_recovery();
                        }
                    }
                }

                result = poll_pending(&mut mutation) => {
                    mutation = None;
                    match result {
                        Ok(reply) => {
                            for message in reply.doc_ops {
                                let applied =
                                    self.receiver.on_doc_op_received(&mut self.document, message);
                                self.emit(&events, applied);
                            }
                        }
                        Err(e) => {
                            warn!("Sending ops for {} failed: {}", key, e);
                            if recovery.is_none() {
                                recovery = self.start_recovery();
                            }
                        }
                    }
                }

                result = poll_pending(&mut recovery) => {
                    recovery = None;
                    match result {
                        Ok(response) => {
                            let applied =
                                self.recoverer
                                    .complete(&mut self.receiver, &mut self.document, response);
                            self.emit(&events, applied);
                            if let Some(error) = self.receiver.take_apply_error() {
                                // The server's own ops do not fit the local text.
                                error!("Recovered ops for {} did not apply: {}", key, error);
                                let _ = events.send(SessionEvent::RecoveryFailed {
                                    key: key.clone(),
                                    error,
                                });
                            }
                        }
                        Err(e) => match self.recoverer.fail(&e) {
                            RetryDecision::Retry(delay) => {
                                recovery = self
                                    .recoverer
                                    .pending_request()
                                    .cloned()
                                    .map(|request| self.recovery_request(request, Some(delay)));
                            }
                            RetryDecision::GiveUp => {
                                error!("Recovery for {} failed: {}", key, e);
                                let _ = events.send(SessionEvent::RecoveryFailed {
                                    key: key.clone(),
                                    error: e.to_string(),
                                });
                            }
                        },
                    }
                }
            }

            if let Some(error) = self.receiver.take_apply_error() {
                warn!("{} for {}, recovering", error, key);
                if recovery.is_none() {
                    recovery = self.start_recovery();
                }
            }

            // Send the next batch once nothing is in flight.
            if mutation.is_none() && !self.recoverer.is_recovering() {
                match self.document.flush() {
                    Ok(Some(message)) => {
                        let api = self.api.clone();
                        mutation = Some(Box::pin(async move { api.mutate_document(message).await }));
                    }
                    Ok(None) => {}
                    Err(e) => error!("Could not serialize ops for {}: {}", key, e),
                }
            }
        }

        self.receiver.disconnect();
        info!("Collaboration session closed for {}", key);
        let _ = events.send(SessionEvent::Closed { key });
    }

    fn start_recovery(&mut self) -> Option<Pending<RecoverFromMissedDocOpsResponse>> {
        let request = self.recoverer.begin(&mut self.receiver, &self.document)?;
        Some(self.recovery_request(request, None))
    }

    fn recovery_request(
        &self,
        request: RecoverFromMissedDocOps,
        delay: Option<std::time::Duration>,
    ) -> Pending<RecoverFromMissedDocOpsResponse> {
        let api = self.api.clone();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            api.recover_missed_doc_ops(request).await
        })
    }

    fn emit(&self, events: &mpsc::UnboundedSender<SessionEvent>, applied: Vec<ServerToClientDocOp>) {
        for message in applied {
            let is_local = message.client_id == self.document.client_id();
            let _ = events.send(SessionEvent::DocOpApplied {
                revision: message.applied_cc_revision,
                client_id: message.client_id,
                selection: message.selection,
                is_local,
            });
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_pending<T>(pending: &mut Option<Pending<T>>) -> ClientResult<T> {
    match pending {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{AppliedDocOp, VersionedDocument};
    use crate::ot::Document;
    use crate::sync::messages::ClientToServerDocOp;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-process stand-in for the server side of one edit session
    struct MockServer {
        document: Mutex<VersionedDocument>,
        recovery_failures: AtomicUsize,
        recovery_calls: AtomicUsize,
    }

    impl MockServer {
        fn new(text: &str) -> Self {
            Self {
                document: Mutex::new(VersionedDocument::new(text, 100)),
                recovery_failures: AtomicUsize::new(0),
                recovery_calls: AtomicUsize::new(0),
            }
        }

        fn to_message(revision: u64, applied: AppliedDocOp) -> ServerToClientDocOp {
            ServerToClientDocOp {
                file_edit_session_key: "k".to_string(),
                client_id: applied.author_client_id,
                applied_cc_revision: revision,
                doc_op: applied.doc_op,
                selection: None,
                file_path: "/a.txt".to_string(),
            }
        }

        /// Edit by another collaborator; returns its broadcast
        fn remote_edit(&self, line: usize, column: usize, text: &str) -> ServerToClientDocOp {
            let mut document = self.document.lock();
            let current = Document::from_text(&document.as_text().text);
            let op = current.insert_op(line, column, text).unwrap();
            let revision = document.cc_revision();
            let result = document.consume(&[op], "other", revision, None).unwrap().unwrap();
            let (revision, applied) = result.applied.into_iter().next().unwrap();
            Self::to_message(revision, applied)
        }

        fn consume(&self, author: &str, revision: u64, doc_ops: &[String]) -> Vec<ServerToClientDocOp> {
            let ops: Vec<DocOp> = doc_ops.iter().map(|op| DocOp::from_json(op).unwrap()).collect();
            match self.document.lock().consume(&ops, author, revision, None).unwrap() {
                Some(result) => result
                    .applied
                    .into_iter()
                    .map(|(revision, applied)| Self::to_message(revision, applied))
                    .collect(),
                None => Vec::new(),
            }
        }
    }

    #[async_trait]
    impl DocOpApi for MockServer {
        async fn mutate_document(
            &self,
            message: ClientToServerDocOp,
        ) -> ClientResult<ServerToClientDocOps> {
            Ok(ServerToClientDocOps {
                doc_ops: self.consume(&message.client_id, message.cc_revision, &message.doc_ops),
            })
        }
    }

    #[async_trait]
    impl RecoveryApi for MockServer {
        async fn recover_missed_doc_ops(
            &self,
            message: RecoverFromMissedDocOps,
        ) -> ClientResult<RecoverFromMissedDocOpsResponse> {
            self.recovery_calls.fetch_add(1, Ordering::SeqCst);
            if self.recovery_failures.load(Ordering::SeqCst) > 0 {
                self.recovery_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ClientError::Transport("offline".to_string()));
            }
            if !message.doc_ops.is_empty() {
                self.consume(&message.client_id, message.current_cc_revision, &message.doc_ops);
            }
            let doc_ops = self
                .document
                .lock()
                .get_applied_doc_ops(message.current_cc_revision + 1)
                .into_iter()
                .map(|(revision, applied)| Self::to_message(revision, applied))
                .collect();
            Ok(RecoverFromMissedDocOpsResponse { doc_ops })
        }
    }

    fn start(
        server: Arc<MockServer>,
        text: &str,
    ) -> (
        CollaborationSessionHandle,
        mpsc::UnboundedSender<ServerToClientDocOp>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let config = ClientConfig::default()
            .with_reorder_timeout(Duration::from_millis(200))
            .with_recovery_retry_delay(Duration::from_millis(100))
            .with_max_recovery_attempts(2);
        let document = LocalDocument::new("k", "me", text, 0);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = CollaborationSession::new(server, document, &config).spawn(incoming_rx, events_tx);
        (handle, incoming_tx, events_rx)
    }

    #[tokio::test]
    async fn test_local_edit_is_acknowledged() {
        let server = Arc::new(MockServer::new("abc"));
        let (handle, _incoming, mut events) = start(server.clone(), "abc");

        let op = Document::from_text("abc").insert_op(0, 3, "d").unwrap();
        handle.edit(op).await.unwrap();

        match events.recv().await {
            Some(SessionEvent::DocOpApplied {
                revision, is_local, ..
            }) => {
                assert_eq!(revision, 1);
                assert!(is_local);
            }
            other => panic!("expected applied event, got {:?}", other),
        }
        assert_eq!(handle.snapshot().await.unwrap(), (1, "abcd".to_string()));
        assert_eq!(server.document.lock().as_text().text, "abcd");

        handle.close().await;
        assert!(matches!(events.recv().await, Some(SessionEvent::Closed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_timeout_recovers() {
        let server = Arc::new(MockServer::new("abc"));
        let (handle, incoming, mut events) = start(server.clone(), "abc");

        let _lost = server.remote_edit(0, 0, "x");
        let second = server.remote_edit(0, 4, "y");
        incoming.send(second).unwrap();

        let mut revisions = Vec::new();
        while revisions.len() < 2 {
            match events.recv().await {
                Some(SessionEvent::DocOpApplied { revision, .. }) => revisions.push(revision),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(revisions, vec![1, 2]);
        assert_eq!(server.recovery_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.snapshot().await.unwrap(), (2, "xabcy".to_string()));
    }

    #[tokio::test]
    async fn test_op_that_does_not_apply_triggers_recovery() {
        let server = Arc::new(MockServer::new("abc"));
        let (handle, incoming, mut events) = start(server.clone(), "abc");

        let mut garbled = server.remote_edit(0, 0, "x");
        garbled.doc_op = Document::from_text("zzz").delete_op(0, 0, 1).unwrap();
        incoming.send(garbled).unwrap();

        match events.recv().await {
            Some(SessionEvent::DocOpApplied {
                revision, is_local, ..
            }) => {
                assert_eq!(revision, 1);
                assert!(!is_local);
            }
            other => panic!("expected applied event, got {:?}", other),
        }
        assert_eq!(server.recovery_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.snapshot().await.unwrap(), (1, "xabc".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_failure_is_reported() {
        let server = Arc::new(MockServer::new("abc"));
        server.recovery_failures.store(10, Ordering::SeqCst);
        let (handle, _incoming, mut events) = start(server.clone(), "abc");

        handle.recover().unwrap();
        match events.recv().await {
            Some(SessionEvent::RecoveryFailed { key, .. }) => assert_eq!(key, "k"),
            other => panic!("expected recovery failure, got {:?}", other),
        }
        // First attempt plus two retries.
        assert_eq!(server.recovery_calls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.snapshot().await.unwrap().0, 0);
    }
}
