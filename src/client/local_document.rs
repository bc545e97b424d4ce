//! The client's copy of a file under collaborative editing.
//!
//! Local edits apply immediately. They are sent one batch at a time; a batch
//! is acknowledged when the server's ops for it come back through the
//! receiver carrying this client's id. Remote ops are transformed against
//! every local op the server has not applied yet before they touch the
//! text.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::revision::{DocOpSink, LastClientToServerDocOpProvider, RevisionProvider};
use super::{ClientError, ClientResult};
use crate::ot::{transform, DocOp, Document, DocumentSelection, OtResult};
use crate::sync::messages::{ClientToServerDocOp, GetFileContentsResponse, ServerToClientDocOp};
use crate::sync::{ClientId, FileEditSessionKey};

#[derive(Debug, Clone)]
pub struct LocalDocument {
    key: FileEditSessionKey,
    client_id: ClientId,
    document: Document,
    revision: u64,
    /// Sent but not applied by the server yet
    unacked: VecDeque<DocOp>,
    /// Not sent yet
    pending: Vec<DocOp>,
    last_sent: Option<ClientToServerDocOp>,
    selection: Option<DocumentSelection>,
}

impl LocalDocument {
    pub fn new(
        key: impl Into<FileEditSessionKey>,
        client_id: impl Into<ClientId>,
        contents: &str,
        revision: u64,
    ) -> Self {
        Self {
            key: key.into(),
            client_id: client_id.into(),
            document: Document::from_text(contents),
            revision,
            unacked: VecDeque::new(),
            pending: Vec::new(),
            last_sent: None,
            selection: None,
        }
    }

    /// Start from the server's answer to a file open
    pub fn from_file_contents(client_id: impl Into<ClientId>, file: &GetFileContentsResponse) -> Self {
        Self::new(
            file.file_edit_session_key.clone(),
            client_id,
            &file.contents,
            file.cc_revision,
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn text(&self) -> String {
        self.document.text()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn selection(&self) -> Option<&DocumentSelection> {
        self.selection.as_ref()
    }

    /// Selection sent along with the next batch
    pub fn set_selection(&mut self, selection: Option<DocumentSelection>) {
        self.selection = selection;
    }

    /// Apply a local edit. It is sent with the next [`flush`](Self::flush).
    pub fn apply_local(&mut self, op: DocOp) -> ClientResult<()> {
        self.document.apply(&op)?;
        if let Some(selection) = &self.selection {
            self.selection = Some(selection.transform(&op));
        }
        self.pending.push(op);
        Ok(())
    }

    pub fn has_unacked(&self) -> bool {
        !self.unacked.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Package pending edits for the server. Nothing is sent while an
    /// earlier batch is still unacknowledged.
    pub fn flush(&mut self) -> ClientResult<Option<ClientToServerDocOp>> {
        if !self.unacked.is_empty() || self.pending.is_empty() {
            return Ok(None);
        }

        let doc_ops = self
            .pending
            .iter()
            .map(DocOp::to_json)
            .collect::<OtResult<Vec<_>>>()?;
        let message = ClientToServerDocOp {
            file_edit_session_key: self.key.clone(),
            client_id: self.client_id.clone(),
            cc_revision: self.revision,
            selection: self.selection.clone(),
            doc_ops,
        };

        self.unacked = self.pending.drain(..).collect();
        self.last_sent = Some(message.clone());
        Ok(Some(message))
    }

    fn apply_remote(&mut self, remote: &DocOp) -> ClientResult<()> {
        let mut remote = remote.clone();
        let mut unacked = Vec::with_capacity(self.unacked.len());
        let mut pending = Vec::with_capacity(self.pending.len());

        for local in &self.unacked {
            let pair = transform(local, &remote)?;
            unacked.push(pair.client_op);
            remote = pair.server_op;
        }
        for local in &self.pending {
            let pair = transform(local, &remote)?;
            pending.push(pair.client_op);
            remote = pair.server_op;
        }

        self.document.apply(&remote)?;
        self.unacked = unacked.into();
        self.pending = pending;
        if let Some(selection) = &self.selection {
            self.selection = Some(selection.transform(&remote));
        }
        Ok(())
    }
}

impl RevisionProvider for LocalDocument {
    fn revision(&self) -> u64 {
        self.revision
    }
}

impl DocOpSink for LocalDocument {
    fn apply_server_doc_op(&mut self, message: &ServerToClientDocOp) -> ClientResult<()> {
        if message.applied_cc_revision != self.revision + 1 {
            return Err(ClientError::UnexpectedReply(format!(
                "op for revision {} while at {}",
                message.applied_cc_revision, self.revision
            )));
        }

        if message.client_id == self.client_id && !self.unacked.is_empty() {
            // One of ours, already in the text.
            self.unacked.pop_front();
            if self.unacked.is_empty() {
                self.last_sent = None;
            }
            debug!(
                "Op {} acknowledged for {}",
                message.applied_cc_revision, self.key
            );
        } else {
            self.apply_remote(&message.doc_op)?;
        }

        self.revision = message.applied_cc_revision;
        Ok(())
    }
}

impl LastClientToServerDocOpProvider for LocalDocument {
    fn last_client_to_server_doc_op(&self) -> Option<&ClientToServerDocOp> {
        self.last_sent.as_ref()
    }

    fn clear_last_client_to_server_doc_op(&mut self, sent: &ClientToServerDocOp) {
        if self.last_sent.as_ref() != Some(sent) {
            return;
        }
        self.last_sent = None;

        // Whatever recovery did not bring back was never applied. The ops are
        // already transformed up to the current revision, so send them again.
        if !self.unacked.is_empty() {
            warn!(
                "{} ops for {} were not applied by the server, resending",
                self.unacked.len(),
                self.key
            );
            let mut requeued: Vec<DocOp> = self.unacked.drain(..).collect();
            requeued.append(&mut self.pending);
            self.pending = requeued;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::VersionedDocument;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn broadcast(key: &str, revision: u64, author: &str, doc_op: DocOp) -> ServerToClientDocOp {
        ServerToClientDocOp {
            file_edit_session_key: key.to_string(),
            client_id: author.to_string(),
            applied_cc_revision: revision,
            doc_op,
            selection: None,
            file_path: "/a.txt".to_string(),
        }
    }

    /// Send `message` to the server and return what it broadcasts
    fn submit(server: &mut VersionedDocument, message: &ClientToServerDocOp) -> Vec<ServerToClientDocOp> {
        let ops: Vec<DocOp> = message
            .doc_ops
            .iter()
            .map(|json| DocOp::from_json(json).unwrap())
            .collect();
        let result = server
            .consume(&ops, &message.client_id, message.cc_revision, None)
            .unwrap()
            .unwrap();
        result
            .applied
            .into_iter()
            .map(|(revision, applied)| {
                broadcast(&message.file_edit_session_key, revision, &applied.author_client_id, applied.doc_op)
            })
            .collect()
    }

    #[test]
    fn test_flush_and_ack() {
        let mut doc = LocalDocument::new("k", "me", "abc", 4);
        let op = doc.document().insert_op(0, 3, "d").unwrap();
        doc.apply_local(op.clone()).unwrap();
        assert_eq!(doc.text(), "abcd");

        let sent = doc.flush().unwrap().unwrap();
        assert_eq!(sent.cc_revision, 4);
        assert_eq!(sent.doc_ops.len(), 1);
        assert_eq!(doc.last_client_to_server_doc_op(), Some(&sent));

        // One batch in flight at a time.
        let op = doc.document().insert_op(0, 4, "e").unwrap();
        doc.apply_local(op).unwrap();
        assert!(doc.flush().unwrap().is_none());

        doc.apply_server_doc_op(&broadcast("k", 5, "me", op_for_ack()))
            .unwrap();
        assert_eq!(doc.revision(), 5);
        assert!(!doc.has_unacked());
        assert!(doc.last_client_to_server_doc_op().is_none());
        assert_eq!(doc.text(), "abcde");

        let sent = doc.flush().unwrap().unwrap();
        assert_eq!(sent.cc_revision, 5);
    }

    fn op_for_ack() -> DocOp {
        // The text of an ack is never applied.
        DocOp::default()
    }

    #[test]
    fn test_remote_op_transformed_against_local() {
        let mut doc = LocalDocument::new("k", "me", "abc", 0);
        let local = doc.document().insert_op(0, 0, "X").unwrap();
        doc.apply_local(local).unwrap();
        doc.flush().unwrap();

        let remote = Document::from_text("abc").insert_op(0, 3, "Y").unwrap();
        doc.apply_server_doc_op(&broadcast("k", 1, "other", remote))
            .unwrap();
        assert_eq!(doc.text(), "XabcY");
        assert_eq!(doc.revision(), 1);
        assert!(doc.has_unacked());
    }

    #[test]
    fn test_out_of_order_revision_rejected() {
        let mut doc = LocalDocument::new("k", "me", "abc", 0);
        let remote = Document::from_text("abc").insert_op(0, 0, "Y").unwrap();
        assert!(doc
            .apply_server_doc_op(&broadcast("k", 2, "other", remote))
            .is_err());
        assert_eq!(doc.text(), "abc");
    }

    #[test]
    fn test_two_clients_converge_with_server() {
        let mut server = VersionedDocument::new("hello\nworld", 100);
        let mut alice = LocalDocument::new("k", "alice", "hello\nworld", 0);
        let mut bob = LocalDocument::new("k", "bob", "hello\nworld", 0);

        let op = alice.document().insert_op(0, 5, "!").unwrap();
        alice.apply_local(op).unwrap();
        let op = bob.document().insert_op(1, 0, "big ").unwrap();
        bob.apply_local(op).unwrap();
        let op = bob.document().delete_op(0, 0, 1).unwrap();
        bob.apply_local(op).unwrap();

        let from_alice = alice.flush().unwrap().unwrap();
        let from_bob = bob.flush().unwrap().unwrap();

        let mut broadcasts = submit(&mut server, &from_alice);
        broadcasts.extend(submit(&mut server, &from_bob));
        assert_eq!(server.cc_revision(), 3);

        for message in &broadcasts {
            alice.apply_server_doc_op(message).unwrap();
            bob.apply_server_doc_op(message).unwrap();
        }

        let expected = server.as_text().text;
        assert_eq!(expected, "ello!\nbig world");
        assert_eq!(alice.text(), expected);
        assert_eq!(bob.text(), expected);
        assert!(!alice.has_unacked());
        assert!(!bob.has_unacked());
    }

    fn random_edit(doc: &mut LocalDocument, rng: &mut SmallRng) {
        let text = doc.text();
        let lines: Vec<usize> = text.split('\n').map(|line| line.chars().count()).collect();
        let line = rng.gen_range(0..lines.len());
        let column = rng.gen_range(0..=lines[line]);
        let start: usize = lines[..line].iter().map(|len| len + 1).sum::<usize>() + column;
        let remaining = text.chars().count() - start;

        let op = if remaining > 0 && rng.gen_bool(0.4) {
            let len = rng.gen_range(1..=remaining.min(4));
            doc.document().delete_op(line, column, len).unwrap()
        } else {
            let what = ["a", "bc", "\n", "d\n", "\nef", "g\nh\n"][rng.gen_range(0..6)];
            doc.document().insert_op(line, column, what).unwrap()
        };
        doc.apply_local(op).unwrap();
    }

    fn run_random_session(seed: u64) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let base = "abcdef\nx\nyq\nz";
        let mut server = VersionedDocument::new(base, 1000);
        let mut clients: Vec<LocalDocument> = (0..3)
            .map(|i| LocalDocument::new("k", format!("c{}", i), base, 0))
            .collect();
        let mut to_server: VecDeque<ClientToServerDocOp> = VecDeque::new();
        let mut to_clients: Vec<VecDeque<ServerToClientDocOp>> = vec![VecDeque::new(); 3];

        for _ in 0..150 {
            let i = rng.gen_range(0..clients.len());
            match rng.gen_range(0..4) {
                0 => random_edit(&mut clients[i], &mut rng),
                1 => {
                    if let Some(message) = clients[i].flush().unwrap() {
                        to_server.push_back(message);
                    }
                }
                2 => {
                    if let Some(message) = to_server.pop_front() {
                        for applied in submit(&mut server, &message) {
                            to_clients.iter_mut().for_each(|q| q.push_back(applied.clone()));
                        }
                    }
                }
                _ => {
                    if let Some(message) = to_clients[i].pop_front() {
                        clients[i].apply_server_doc_op(&message).unwrap();
                    }
                }
            }
        }

        // Let everything settle.
        loop {
            for client in clients.iter_mut() {
                if let Some(message) = client.flush().unwrap() {
                    to_server.push_back(message);
                }
            }
            while let Some(message) = to_server.pop_front() {
                for applied in submit(&mut server, &message) {
                    to_clients.iter_mut().for_each(|q| q.push_back(applied.clone()));
                }
            }
            for (client, queue) in clients.iter_mut().zip(to_clients.iter_mut()) {
                while let Some(message) = queue.pop_front() {
                    client.apply_server_doc_op(&message).unwrap();
                }
            }
            if clients.iter().all(|c| !c.has_unacked() && !c.has_pending()) {
                break;
            }
        }

        let expected = server.as_text().text;
        for client in &clients {
            assert_eq!(client.text(), expected, "seed {} client {}", seed, client.client_id());
            assert_eq!(client.revision(), server.cc_revision());
        }
    }

    #[test]
    fn test_random_edits_from_three_clients_converge() {
        for seed in 0..40 {
            run_random_session(seed);
        }
    }

    #[test]
    fn test_unapplied_ops_requeued_after_recovery() {
        let mut doc = LocalDocument::new("k", "me", "abc", 0);
        let op = doc.document().insert_op(0, 0, "X").unwrap();
        doc.apply_local(op).unwrap();
        let sent = doc.flush().unwrap().unwrap();

        doc.clear_last_client_to_server_doc_op(&sent);
        assert!(!doc.has_unacked());
        assert!(doc.has_pending());
        assert_eq!(doc.flush().unwrap().unwrap().doc_ops, sent.doc_ops);
    }
}
