//! End-to-end activation handling.
//!
//! [`ScanRelay::activate`] wires the pieces together: parse the activation
//! URI, start a session, and, once the session has an outcome, deliver it and
//! notify the originating client exactly once.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::activation::ActivationParser;
use crate::delivery::{DeliveryClient, DeliveryFailure, DeliveryResult};
use crate::error::Result;
use crate::notifier::ResultNotifier;
use crate::reader::CardReader;
use crate::session::{ScanSessionController, SessionError, SessionHandle};
use crate::storage::DeadLetterStore;
use crate::types::{ErrorKind, ScanOutcome, SessionPhase, SessionRequest};

/// What happened to one activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    /// The session's outcome.
    pub outcome: ScanOutcome,
    /// How delivery ended; `None` when the scan was cancelled and nothing was
    /// submitted.
    pub delivery: Option<DeliveryResult>,
    /// Error kind reported to the notifier, `None` on success.
    pub reported_kind: Option<ErrorKind>,
}

/// Handle to an activation in progress.
#[derive(Debug)]
pub struct ActiveScan {
    session_id: Uuid,
    request: SessionRequest,
    cancel: CancellationToken,
    phases: watch::Receiver<SessionPhase>,
    report: oneshot::Receiver<RelayReport>,
}

impl ActiveScan {
    /// Session id.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Correlation token.
    #[must_use]
    pub fn scan_id(&self) -> &str {
        &self.request.scan_id
    }

    /// The parsed activation.
    #[must_use]
    pub const fn request(&self) -> &SessionRequest {
        &self.request
    }

    /// Cancel the session, or the delivery if the session already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token shared by the session and its delivery.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Latest session phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.phases.borrow()
    }

    /// Subscribe to session phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phases.clone()
    }

    /// Wait until the outcome was delivered (or not) and reported.
    ///
    /// # Errors
    ///
    /// [`SessionError::Aborted`] if the completion task was dropped.
    pub async fn finished(self) -> std::result::Result<RelayReport, SessionError> {
        self.report.await.map_err(|_| SessionError::Aborted)
    }
}

/// Parses activations, runs sessions and delivers their outcomes.
pub struct ScanRelay<R> {
    parser: ActivationParser,
    controller: ScanSessionController<R>,
    delivery: DeliveryClient,
    notifier: Arc<dyn ResultNotifier>,
    dead_letters: Option<DeadLetterStore>,
}

impl<R> std::fmt::Debug for ScanRelay<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRelay")
            .field("parser", &self.parser)
            .field("controller", &self.controller)
            .field("delivery", &self.delivery)
            .field("dead_letters", &self.dead_letters)
            .finish_non_exhaustive()
    }
}

impl<R: CardReader> ScanRelay<R> {
    /// Assemble a relay.
    pub fn new(
        parser: ActivationParser,
        controller: ScanSessionController<R>,
        delivery: DeliveryClient,
        notifier: Arc<dyn ResultNotifier>,
    ) -> Self {
        Self {
            parser,
            controller,
            delivery,
            notifier,
            dead_letters: None,
        }
    }

    /// Persist permanently undeliverable outcomes in `store`.
    #[must_use]
    pub fn with_dead_letters(mut self, store: DeadLetterStore) -> Self {
        self.dead_letters = Some(store);
        self
    }

    /// The session controller.
    #[must_use]
    pub const fn controller(&self) -> &ScanSessionController<R> {
        &self.controller
    }

    /// The failed-delivery store, if configured.
    #[must_use]
    pub const fn dead_letters(&self) -> Option<&DeadLetterStore> {
        self.dead_letters.as_ref()
    }

    /// Handle an activation URI.
    ///
    /// # Errors
    ///
    /// - Activation errors if the URI is rejected. No session is started.
    /// - [`CardRelayError::SessionActive`](crate::CardRelayError::SessionActive)
    ///   if a scan is already running.
    pub fn activate(&self, uri: &str) -> Result<ActiveScan> {
        let request = self.parser.parse(uri)?;
        self.start(request)
    }

    /// Start a scan for an already parsed request.
    ///
    /// # Errors
    ///
    /// See [`activate`](Self::activate).
    pub fn start(&self, request: SessionRequest) -> Result<ActiveScan> {
        let handle = self.controller.start(request.clone())?;
        self.notifier.on_started(&request);

        let session_id = handle.session_id();
        let cancel = handle.cancel_token();
        let phases = handle.subscribe();
        let (report_tx, report_rx) = oneshot::channel();

        let completion = Completion {
            request: request.clone(),
            delivery: self.delivery.clone(),
            notifier: Arc::clone(&self.notifier),
            dead_letters: self.dead_letters.clone(),
            cancel: cancel.clone(),
        };
        let span = info_span!("scan_relay", %session_id, scan_id = %request.scan_id);
        // `controller.start` succeeded, so a runtime is present.
        tokio::spawn(
            async move {
                let report = completion.run(handle).await;
                let _ = report_tx.send(report);
            }
            .instrument(span),
        );

        Ok(ActiveScan {
            session_id,
            request,
            cancel,
            phases,
            report: report_rx,
        })
    }
}

struct Completion {
    request: SessionRequest,
    delivery: DeliveryClient,
    notifier: Arc<dyn ResultNotifier>,
    dead_letters: Option<DeadLetterStore>,
    cancel: CancellationToken,
}

impl Completion {
    async fn run(self, handle: SessionHandle) -> RelayReport {
        let outcome = self.await_outcome(handle).await;

        if outcome.is_cancelled() {
            self.notifier.on_failure(&outcome, ErrorKind::Cancelled);
            return RelayReport {
                outcome,
                delivery: None,
                reported_kind: Some(ErrorKind::Cancelled),
            };
        }

        let report = self.delivery.submit(outcome, &self.cancel).await;
        if let DeliveryResult::Exhausted { failure, .. } = &report.result {
            self.record_dead_letter(&report.outcome, failure).await;
        }

        let outcome = report.outcome;
        let reported_kind = report.result.error_kind().or(outcome.error_kind);
        match reported_kind {
            None => self.notifier.on_success(&outcome),
            Some(kind) => self.notifier.on_failure(&outcome, kind),
        }

        RelayReport {
            outcome,
            delivery: Some(report.result),
            reported_kind,
        }
    }

    /// Wait for the session outcome while forwarding phase changes, so every
    /// phase reaches the notifier before the terminal call.
    async fn await_outcome(&self, handle: SessionHandle) -> ScanOutcome {
        let mut phases = handle.subscribe();
        let mut forwarded = SessionPhase::Idle;
        let current = *phases.borrow_and_update();
        if current != forwarded {
            forwarded = current;
            self.notifier.on_state_changed(&self.request.scan_id, current);
        }
        let mut phases_open = true;
        let outcome = handle.outcome();
        tokio::pin!(outcome);

        let result = loop {
            tokio::select! {
                biased;
                changed = phases.changed(), if phases_open => {
                    if changed.is_err() {
                        phases_open = false;
                        continue;
                    }
                    let phase = *phases.borrow_and_update();
                    if phase != forwarded {
                        forwarded = phase;
                        self.notifier.on_state_changed(&self.request.scan_id, phase);
                    }
                }
                result = &mut outcome => break result,
            }
        };

        let last = *phases.borrow();
        if last != forwarded {
            self.notifier.on_state_changed(&self.request.scan_id, last);
        }

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Session ended without an outcome");
                ScanOutcome::failed(&self.request, ErrorKind::ReadError)
            }
        }
    }

    async fn record_dead_letter(&self, outcome: &ScanOutcome, failure: &DeliveryFailure) {
        let Some(store) = self.dead_letters.clone() else {
            return;
        };
        let outcome = outcome.clone();
        let failure = failure.clone();
        match tokio::task::spawn_blocking(move || store.record(&outcome, &failure)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to persist undelivered outcome"),
            Err(e) => warn!(error = %e, "Dead-letter write task failed"),
        }
    }
}
