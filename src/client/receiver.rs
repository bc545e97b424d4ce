//! Receives server ops for one edit session and applies them in order.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, warn};

use super::reorderer::Reorderer;
use super::revision::DocOpSink;
use super::ClientResult;
use crate::sync::messages::ServerToClientDocOp;
use crate::sync::FileEditSessionKey;

pub struct DocOpReceiver {
    key: FileEditSessionKey,
    reorderer: Reorderer<ServerToClientDocOp>,
    timeout: Duration,
    paused: bool,
    /// Ops released while paused, in order
    queued: Vec<ServerToClientDocOp>,
    /// Why the last op failed to apply, until taken
    apply_error: Option<String>,
}

impl DocOpReceiver {
    pub fn new(key: impl Into<FileEditSessionKey>, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            reorderer: Reorderer::new(1, timeout),
            timeout,
            paused: false,
            queued: Vec::new(),
            apply_error: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Start expecting the op after `start_revision`
    pub fn connect(&mut self, start_revision: u64) {
        self.reorderer = Reorderer::new(start_revision + 1, self.timeout);
        self.paused = false;
        self.queued.clear();
        self.apply_error = None;
    }

    pub fn disconnect(&mut self) {
        self.reorderer.cleanup();
        self.queued.clear();
    }

    /// Feed an op straight off the wire. Returns the ops applied as a result.
    pub fn on_doc_op_received<S: DocOpSink>(
        &mut self,
        sink: &mut S,
        message: ServerToClientDocOp,
    ) -> Vec<ServerToClientDocOp> {
        if message.file_edit_session_key != self.key {
            warn!(
                "Receiver for {} got an op for {}",
                self.key, message.file_edit_session_key
            );
            return Vec::new();
        }

        let released = self.reorderer.accept(message.applied_cc_revision, message);
        self.deliver_released(sink, released)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.reorderer.deadline()
    }

    /// Returns the last revision released when the gap timeout fires
    pub fn poll_timeout(&mut self, now: Instant) -> Option<u64> {
        self.reorderer.poll_timeout(now)
    }

    /// Hold released ops back instead of applying them
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.reorderer.set_timeout_enabled(false);
        // Only ops released after this pause are kept.
        self.queued.clear();
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Leave the paused state and continue at `next_expected`
    pub fn resume<S: DocOpSink>(
        &mut self,
        sink: &mut S,
        next_expected: u64,
    ) -> Vec<ServerToClientDocOp> {
        if !self.paused {
            warn!("Resuming receiver for {} that was not paused", self.key);
        }
        self.paused = false;
        self.reorderer.set_timeout_enabled(true);
        let released = self.reorderer.skip_to_version(next_expected);
        self.deliver_released(sink, released)
    }

    /// Deliver `message` as if the reorderer had released it
    pub fn simulate_ordered<S: DocOpSink>(
        &mut self,
        sink: &mut S,
        message: ServerToClientDocOp,
        bypass_pause: bool,
    ) -> Option<ServerToClientDocOp> {
        self.deliver(sink, message, bypass_pause).ok().flatten()
    }

    /// Take the ops queued while paused
    pub fn drain_queued(&mut self) -> Vec<ServerToClientDocOp> {
        std::mem::take(&mut self.queued)
    }

    /// Why the last op failed to apply, if one did since the last call.
    /// The gap it left behind is already waiting for recovery.
    pub fn take_apply_error(&mut self) -> Option<String> {
        self.apply_error.take()
    }

    fn deliver_released<S: DocOpSink>(
        &mut self,
        sink: &mut S,
        released: Vec<(u64, ServerToClientDocOp)>,
    ) -> Vec<ServerToClientDocOp> {
        let mut applied = Vec::new();
        let mut released = released.into_iter();
        while let Some((_, message)) = released.next() {
            match self.deliver(sink, message, false) {
                Ok(Some(message)) => applied.push(message),
                Ok(None) => {}
                Err(_) => {
                    // Everything after the failed op waits behind the gap.
                    for (version, message) in released {
                        self.reorderer.accept(version, message);
                    }
                    break;
                }
            }
        }
        applied
    }

    /// `Ok(None)` when the op was queued or already applied. On failure the
    /// reorderer is sent back to the first revision the sink is missing.
    fn deliver<S: DocOpSink>(
        &mut self,
        sink: &mut S,
        message: ServerToClientDocOp,
        bypass_pause: bool,
    ) -> ClientResult<Option<ServerToClientDocOp>> {
        if self.paused && !bypass_pause {
            self.queued.push(message);
            return Ok(None);
        }

        if sink.revision() >= message.applied_cc_revision {
            // Already applied
            return Ok(None);
        }

        match sink.apply_server_doc_op(&message) {
            Ok(()) => Ok(Some(message)),
            Err(e) => {
                error!(
                    "Could not apply op {} for {}: {}",
                    message.applied_cc_revision, self.key, e
                );
                self.reorderer.reopen_gap(sink.revision() + 1);
                self.apply_error = Some(format!(
                    "op {} did not apply: {}",
                    message.applied_cc_revision, e
                ));
                Err(e)
            }
        }
    }
}
