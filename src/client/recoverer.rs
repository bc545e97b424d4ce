//! Recovery of ops a client missed.
//!
//! Recovery is split into synchronous steps ([`DocOpRecoverer::begin`],
//! [`DocOpRecoverer::complete`], [`DocOpRecoverer::fail`]) so an actor can
//! keep receiving broadcasts while the request is in flight. Ops that
//! arrive meanwhile are queued by the paused receiver and replayed after
//! the response; anything applied twice is skipped by revision.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::receiver::DocOpReceiver;
use super::revision::{DocOpSink, LastClientToServerDocOpProvider};
use super::{ClientConfig, ClientError, ClientResult, RecoveryApi};
use crate::sync::messages::{
    ClientToServerDocOp, RecoverFromMissedDocOps, RecoverFromMissedDocOpsResponse,
    ServerToClientDocOp,
};
use crate::sync::{ClientId, FileEditSessionKey};

/// What to do after a failed recovery request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the same request again after the delay
    Retry(Duration),
    /// Stop; the local revision is unchanged so a later recovery can run
    GiveUp,
}

struct InFlight {
    request: RecoverFromMissedDocOps,
    last_sent: Option<ClientToServerDocOp>,
}

pub struct DocOpRecoverer {
    key: FileEditSessionKey,
    client_id: ClientId,
    max_attempts: u32,
    retry_delay: Duration,
    failures: u32,
    in_flight: Option<InFlight>,
}

impl DocOpRecoverer {
    pub fn new(
        key: impl Into<FileEditSessionKey>,
        client_id: impl Into<ClientId>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            key: key.into(),
            client_id: client_id.into(),
            max_attempts: config.max_recovery_attempts,
            retry_delay: config.recovery_retry_delay,
            failures: 0,
            in_flight: None,
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start a recovery. Returns `None` if one is already outstanding.
    pub fn begin<L>(
        &mut self,
        receiver: &mut DocOpReceiver,
        local: &L,
    ) -> Option<RecoverFromMissedDocOps>
    where
        L: DocOpSink + LastClientToServerDocOpProvider,
    {
        if self.in_flight.is_some() {
            debug!("Recovery for {} already in progress", self.key);
            return None;
        }
        info!("Recovering missed ops for {}", self.key);

        // Unacknowledged ops go along with the request; the server applies
        // them once even if it already has.
        let last_sent = local.last_client_to_server_doc_op().cloned();
        receiver.pause();

        let request = RecoverFromMissedDocOps {
            file_edit_session_key: self.key.clone(),
            client_id: self.client_id.clone(),
            current_cc_revision: last_sent
                .as_ref()
                .map(|sent| sent.cc_revision)
                .unwrap_or_else(|| local.revision()),
            doc_ops: last_sent
                .as_ref()
                .map(|sent| sent.doc_ops.clone())
                .unwrap_or_default(),
        };

        self.failures = 0;
        self.in_flight = Some(InFlight {
            request: request.clone(),
            last_sent,
        });
        Some(request)
    }

    /// The request to (re)send while a recovery is outstanding
    pub fn pending_request(&self) -> Option<&RecoverFromMissedDocOps> {
        self.in_flight.as_ref().map(|in_flight| &in_flight.request)
    }

    /// Merge the server's answer. Returns every op applied as a result.
    pub fn complete<L>(
        &mut self,
        receiver: &mut DocOpReceiver,
        local: &mut L,
        response: RecoverFromMissedDocOpsResponse,
    ) -> Vec<ServerToClientDocOp>
    where
        L: DocOpSink + LastClientToServerDocOpProvider,
    {
        let Some(in_flight) = self.in_flight.take() else {
            warn!("Recovery response for {} with no recovery running", self.key);
            return Vec::new();
        };

        let mut applied = Vec::new();
        let queued = receiver.drain_queued();
        for message in response.doc_ops.into_iter().chain(queued) {
            if message.applied_cc_revision > local.revision() {
                applied.extend(receiver.simulate_ordered(local, message, true));
            }
        }

        if let Some(sent) = &in_flight.last_sent {
            local.clear_last_client_to_server_doc_op(sent);
        }

        let next_expected = local.revision() + 1;
        applied.extend(receiver.resume(local, next_expected));
        self.failures = 0;

        info!(
            "Recovered {} for {} at revision {}",
            applied.len(),
            self.key,
            local.revision()
        );
        applied
    }

    /// Record a failed attempt and decide whether to try again
    pub fn fail(&mut self, error: &ClientError) -> RetryDecision {
        self.failures += 1;
        if error.is_retryable() && self.failures <= self.max_attempts {
            warn!(
                "Recovery attempt {} for {} failed: {}",
                self.failures, self.key, error
            );
            return RetryDecision::Retry(self.retry_delay);
        }

        warn!("Could not recover {}: {}", self.key, error);
        self.in_flight = None;
        self.failures = 0;
        RetryDecision::GiveUp
    }

    /// Run a whole recovery against `api`, retrying as configured.
    ///
    /// Returns the ops applied, or the last error once recovery gives up.
    /// Returns an empty list if a recovery was already outstanding.
    pub async fn recover<A, L>(
        &mut self,
        api: &A,
        receiver: &mut DocOpReceiver,
        local: &mut L,
    ) -> ClientResult<Vec<ServerToClientDocOp>>
    where
        A: RecoveryApi + ?Sized,
        L: DocOpSink + LastClientToServerDocOpProvider,
    {
        let Some(request) = self.begin(receiver, local) else {
            return Ok(Vec::new());
        };

        loop {
            match api.recover_missed_doc_ops(request.clone()).await {
                Ok(response) => return Ok(self.complete(receiver, local, response)),
                Err(e) => match self.fail(&e) {
                    RetryDecision::Retry(delay) => tokio::time::sleep(delay).await,
                    RetryDecision::GiveUp => return Err(e),
                },
            }
        }
    }
}
