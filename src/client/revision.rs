//! Seams between the DocOp machinery and whatever owns the local document.

use super::ClientResult;
use crate::sync::messages::{ClientToServerDocOp, ServerToClientDocOp};

/// The revision the local document is at
pub trait RevisionProvider {
    fn revision(&self) -> u64;
}

/// Receives server ops in revision order
pub trait DocOpSink: RevisionProvider {
    /// Apply the op that produced `message.applied_cc_revision`. Called at
    /// most once per revision, always for `revision() + 1`.
    fn apply_server_doc_op(&mut self, message: &ServerToClientDocOp) -> ClientResult<()>;
}

/// Knows the last batch of local ops sent to the server
pub trait LastClientToServerDocOpProvider {
    fn last_client_to_server_doc_op(&self) -> Option<&ClientToServerDocOp>;

    /// Forget `sent` once recovery has settled it. A newer message is kept.
    fn clear_last_client_to_server_doc_op(&mut self, sent: &ClientToServerDocOp);
}

impl RevisionProvider for u64 {
    fn revision(&self) -> u64 {
        *self
    }
}
