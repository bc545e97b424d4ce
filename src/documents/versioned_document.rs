//! Revisioned text document with an applied-op history.
//!
//! Clients send ops made against the revision they last saw. Before such an
//! op can be applied it is transformed against every op the server applied
//! after that revision (the bridge).

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, error};

use super::{DocumentError, DocumentResult};
use crate::ot::{transform, DocOp, Document, DocumentSelection};
use crate::sync::ClientId;

/// An op as it was applied, with its author
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedDocOp {
    pub doc_op: DocOp,
    pub author_client_id: ClientId,
}

/// Document text at a revision
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedText {
    pub cc_revision: u64,
    pub text: String,
}

/// Ops applied by one `consume` call
#[derive(Debug, Clone, Default)]
pub struct ConsumeResult {
    /// Applied ops keyed by the revision each produced, in order
    pub applied: Vec<(u64, AppliedDocOp)>,
    /// The client's selection moved past the bridge, if there was one
    pub transformed_selection: Option<DocumentSelection>,
}

#[derive(Debug, Clone)]
pub struct VersionedDocument {
    document: Document,
    cc_revision: u64,
    history: VecDeque<(u64, AppliedDocOp)>,
    max_history: usize,
    last_intended: HashMap<ClientId, u64>,
}

impl VersionedDocument {
    pub fn new(text: &str, max_history: usize) -> Self {
        Self {
            document: Document::from_text(text),
            cc_revision: 0,
            history: VecDeque::new(),
            max_history: max_history.max(1),
            last_intended: HashMap::new(),
        }
    }

    pub fn cc_revision(&self) -> u64 {
        self.cc_revision
    }

    pub fn as_text(&self) -> VersionedText {
        VersionedText {
            cc_revision: self.cc_revision,
            text: self.document.text(),
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.document.len_bytes()
    }

    /// Lowest revision still held in memory. `cc_revision + 1` when the
    /// history is empty.
    pub fn oldest_retained_revision(&self) -> u64 {
        self.history
            .front()
            .map(|(revision, _)| *revision)
            .unwrap_or(self.cc_revision + 1)
    }

    /// Apply `doc_ops`, made one after another against
    /// `intended_cc_revision`.
    ///
    /// Returns `Ok(None)` when the same author already had ops applied at
    /// this intended revision (a retry) or at a later one (obsolete). The
    /// batch is applied entirely or not at all.
    pub fn consume(
        &mut self,
        doc_ops: &[DocOp],
        author_client_id: &str,
        intended_cc_revision: u64,
        selection: Option<DocumentSelection>,
    ) -> DocumentResult<Option<ConsumeResult>> {
        if let Some(&last) = self.last_intended.get(author_client_id) {
            if intended_cc_revision == last {
                debug!(
                    "Ignoring retried ops from {} at revision {}",
                    author_client_id, intended_cc_revision
                );
                return Ok(None);
            }
            if intended_cc_revision < last {
                error!(
                    "Dropping obsolete ops from {}: intended revision {} is older than {}",
                    author_client_id, intended_cc_revision, last
                );
                return Ok(None);
            }
        }

        if intended_cc_revision > self.cc_revision {
            return Err(DocumentError::DocumentOperation(format!(
                "intended revision {} is ahead of the document at {}",
                intended_cc_revision, self.cc_revision
            )));
        }

        let bridge_start = intended_cc_revision + 1;
        let oldest = self.oldest_retained_revision();
        if bridge_start < oldest {
            return Err(DocumentError::HistoryUnavailable {
                requested: bridge_start,
                oldest,
            });
        }

        let mut bridge: Vec<DocOp> = self
            .history
            .iter()
            .filter(|(revision, _)| *revision >= bridge_start)
            .map(|(_, applied)| applied.doc_op.clone())
            .collect();

        let mut document = self.document.clone();
        let mut revision = self.cc_revision;
        let mut applied = Vec::with_capacity(doc_ops.len());

        for doc_op in doc_ops {
            let mut client_op = doc_op.clone();
            for server_op in bridge.iter_mut() {
                let pair = transform(&client_op, server_op)?;
                client_op = pair.client_op;
                *server_op = pair.server_op;
            }

            document.apply(&client_op)?;
            revision += 1;
            applied.push((
                revision,
                AppliedDocOp {
                    doc_op: client_op,
                    author_client_id: author_client_id.to_string(),
                },
            ));
        }

        let transformed_selection = match (selection, bridge.is_empty()) {
            (Some(selection), false) => Some(
                bridge
                    .iter()
                    .fold(selection, |selection, op| selection.transform(op)),
            ),
            (selection, true) => selection,
            (None, false) => None,
        };

        self.document = document;
        self.cc_revision = revision;
        self.history.extend(applied.iter().cloned());
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
        self.last_intended
            .insert(author_client_id.to_string(), intended_cc_revision);

        Ok(Some(ConsumeResult {
            applied,
            transformed_selection,
        }))
    }

    /// Retained applied ops with revision `>= starting_revision`
    pub fn get_applied_doc_ops(&self, starting_revision: u64) -> BTreeMap<u64, AppliedDocOp> {
        self.history
            .iter()
            .filter(|(revision, _)| *revision >= starting_revision)
            .map(|(revision, applied)| (*revision, applied.clone()))
            .collect()
    }

    /// Put older ops back in front of the retained history.
    ///
    /// Only a run that ends right before the oldest retained revision is
    /// taken; anything else is ignored. Returns how many ops were added.
    pub fn backfill_history(&mut self, ops: Vec<(u64, AppliedDocOp)>) -> usize {
        let mut expected = self.oldest_retained_revision();
        let mut added = 0;
        for (revision, applied) in ops.into_iter().rev() {
            if revision >= expected {
                continue;
            }
            if revision + 1 != expected || revision == 0 {
                break;
            }
            self.history.push_front((revision, applied));
            expected = revision;
            added += 1;
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::FilePosition;

    fn insert(text: &str, line: usize, column: usize, what: &str) -> DocOp {
        Document::from_text(text).insert_op(line, column, what).unwrap()
    }

    #[test]
    fn test_revisions_increase_by_one() {
        let mut doc = VersionedDocument::new("abc", 100);
        let first = insert("abc", 0, 3, "d");
        let second = insert("abcd", 0, 4, "e");

        let result = doc
            .consume(&[first, second], "a", 0, None)
            .unwrap()
            .unwrap();

        let revisions: Vec<u64> = result.applied.iter().map(|(r, _)| *r).collect();
        assert_eq!(revisions, vec![1, 2]);
        assert_eq!(doc.as_text().text, "abcde");
        assert_eq!(doc.cc_revision(), 2);
    }

    #[test]
    fn test_concurrent_ops_converge() {
        let base = "hello\nworld";
        let mut doc = VersionedDocument::new(base, 100);

        doc.consume(&[insert(base, 0, 5, "!")], "a", 0, None)
            .unwrap()
            .unwrap();
        let result = doc
            .consume(&[insert(base, 1, 0, ">")], "b", 0, None)
            .unwrap()
            .unwrap();

        assert_eq!(doc.as_text().text, "hello!\n>world");
        assert_eq!(result.applied[0].0, 2);
        assert_eq!(result.applied[0].1.author_client_id, "b");
    }

    #[test]
    fn test_same_position_client_insert_lands_first() {
        let base = "ab";
        let mut doc = VersionedDocument::new(base, 100);

        doc.consume(&[insert(base, 0, 1, "S")], "server-side", 0, None)
            .unwrap();
        doc.consume(&[insert(base, 0, 1, "C")], "late", 0, None)
            .unwrap();

        assert_eq!(doc.as_text().text, "aCSb");
    }

    #[test]
    fn test_retry_and_obsolete_are_dropped() {
        let mut doc = VersionedDocument::new("x", 100);
        let op = insert("x", 0, 0, "a");

        assert!(doc.consume(&[op.clone()], "a", 0, None).unwrap().is_some());
        assert!(doc.consume(&[op], "a", 0, None).unwrap().is_none());
        assert_eq!(doc.cc_revision(), 1);

        doc.consume(&[insert("ax", 0, 0, "b")], "a", 1, None)
            .unwrap()
            .unwrap();
        assert!(doc
            .consume(&[insert("x", 0, 0, "c")], "a", 0, None)
            .unwrap()
            .is_none());
        assert_eq!(doc.as_text().text, "bax");
    }

    #[test]
    fn test_failed_batch_leaves_document_untouched() {
        let mut doc = VersionedDocument::new("abc", 100);
        let good = insert("abc", 0, 0, "x");
        let bad = Document::from_text("zzz").delete_op(0, 0, 1).unwrap();

        let err = doc.consume(&[good, bad], "a", 0, None).unwrap_err();
        assert!(matches!(err, DocumentError::DocumentOperation(_)));
        assert_eq!(doc.as_text().text, "abc");
        assert_eq!(doc.cc_revision(), 0);

        // A failed batch does not count as seen, so a corrected retry goes through.
        let fixed = insert("abc", 0, 0, "y");
        assert!(doc.consume(&[fixed], "a", 0, None).unwrap().is_some());
    }

    #[test]
    fn test_intended_revision_ahead_is_rejected() {
        let mut doc = VersionedDocument::new("abc", 100);
        let op = insert("abc", 0, 0, "x");
        assert!(matches!(
            doc.consume(&[op], "a", 3, None),
            Err(DocumentError::DocumentOperation(_))
        ));
    }

    #[test]
    fn test_history_trimming_and_backfill() {
        let mut doc = VersionedDocument::new("", 3);
        let mut text = String::new();
        for i in 0..5u64 {
            let op = insert(&text, 0, text.len(), "x");
            doc.consume(&[op], "a", i, None).unwrap().unwrap();
            text.push('x');
        }

        assert_eq!(doc.oldest_retained_revision(), 3);
        assert_eq!(
            doc.get_applied_doc_ops(0).keys().copied().collect::<Vec<_>>(),
            vec![3, 4, 5]
        );

        let late = insert("x", 0, 0, "y");
        match doc.consume(&[late.clone()], "b", 1, None) {
            Err(DocumentError::HistoryUnavailable { requested, oldest }) => {
                assert_eq!(requested, 2);
                assert_eq!(oldest, 3);
            }
            other => panic!("expected HistoryUnavailable, got {:?}", other),
        }

        let backfill = vec![(
            2,
            AppliedDocOp {
                doc_op: insert("x", 0, 1, "x"),
                author_client_id: "a".to_string(),
            },
        )];
        assert_eq!(doc.backfill_history(backfill), 1);
        assert_eq!(doc.oldest_retained_revision(), 2);

        doc.consume(&[late], "b", 1, None).unwrap().unwrap();
        assert_eq!(doc.as_text().text, "yxxxxx");
    }

    #[test]
    fn test_backfill_ignores_gaps() {
        let mut doc = VersionedDocument::new("", 1);
        doc.consume(&[insert("", 0, 0, "a")], "a", 0, None).unwrap();
        doc.consume(&[insert("a", 0, 1, "b")], "a", 1, None).unwrap();
        assert_eq!(doc.oldest_retained_revision(), 2);

        let stray = AppliedDocOp {
            doc_op: insert("", 0, 0, "a"),
            author_client_id: "a".to_string(),
        };
        assert_eq!(doc.backfill_history(vec![(0, stray)]), 0);
    }

    #[test]
    fn test_selection_moves_past_bridge() {
        let base = "abc\ndef";
        let mut doc = VersionedDocument::new(base, 100);
        doc.consume(&[insert(base, 0, 0, "new\n")], "a", 0, None)
            .unwrap();

        let selection = DocumentSelection {
            user_id: "b".to_string(),
            base_position: FilePosition::new(1, 1),
            cursor_position: FilePosition::new(1, 2),
        };
        let result = doc
            .consume(&[insert(base, 1, 3, "g")], "b", 0, Some(selection))
            .unwrap()
            .unwrap();

        let moved = result.transformed_selection.unwrap();
        assert_eq!(moved.base_position, FilePosition::new(2, 1));
        assert_eq!(moved.cursor_position, FilePosition::new(2, 2));
        assert_eq!(doc.as_text().text, "new\nabc\ndefg");
    }
}
