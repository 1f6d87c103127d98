//! Completion signalling back to the originating client.
//!
//! A [`ResultNotifier`] receives exactly one terminal call per activation:
//! [`on_success`](ResultNotifier::on_success) or
//! [`on_failure`](ResultNotifier::on_failure). Implementations are called
//! from the session's completion task and must return promptly; anything
//! slow belongs behind a channel.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{ErrorKind, ScanOutcome, SessionPhase, SessionRequest};

/// Receives session progress and the single terminal result.
pub trait ResultNotifier: Send + Sync {
    /// A session was started for `request`.
    fn on_started(&self, request: &SessionRequest) {
        let _ = request;
    }

    /// The session for `scan_id` entered `phase`.
    fn on_state_changed(&self, scan_id: &str, phase: SessionPhase) {
        let _ = (scan_id, phase);
    }

    /// The card was read and the outcome delivered.
    fn on_success(&self, outcome: &ScanOutcome);

    /// The session or its delivery failed, or the scan was cancelled.
    fn on_failure(&self, outcome: &ScanOutcome, kind: ErrorKind);
}

/// Message emitted by a [`ChannelNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// See [`ResultNotifier::on_started`].
    Started(SessionRequest),
    /// See [`ResultNotifier::on_state_changed`].
    StateChanged {
        /// Correlation token.
        scan_id: String,
        /// New phase.
        phase: SessionPhase,
    },
    /// See [`ResultNotifier::on_success`].
    Succeeded(ScanOutcome),
    /// See [`ResultNotifier::on_failure`].
    Failed {
        /// The outcome as produced by the session.
        outcome: ScanOutcome,
        /// Reported failure kind.
        kind: ErrorKind,
    },
}

impl Notification {
    /// Returns `true` for the terminal notifications.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed { .. })
    }
}

/// Forwards every call into an unbounded channel.
///
/// Sending never blocks; calls made after the receiver is dropped are
/// discarded.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl ResultNotifier for ChannelNotifier {
    fn on_started(&self, request: &SessionRequest) {
        self.send(Notification::Started(request.clone()));
    }

    fn on_state_changed(&self, scan_id: &str, phase: SessionPhase) {
        self.send(Notification::StateChanged {
            scan_id: scan_id.to_string(),
            phase,
        });
    }

    fn on_success(&self, outcome: &ScanOutcome) {
        self.send(Notification::Succeeded(outcome.clone()));
    }

    fn on_failure(&self, outcome: &ScanOutcome, kind: ErrorKind) {
        self.send(Notification::Failed {
            outcome: outcome.clone(),
            kind,
        });
    }
}

/// Logs results. Useful as a default when no UI is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl ResultNotifier for TracingNotifier {
    fn on_success(&self, outcome: &ScanOutcome) {
        info!(
            scan_id = %outcome.scan_id,
            client_id = %outcome.client_id,
            card_id = %outcome.card_id,
            "Scan succeeded"
        );
    }

    fn on_failure(&self, outcome: &ScanOutcome, kind: ErrorKind) {
        if kind == ErrorKind::Cancelled {
            info!(scan_id = %outcome.scan_id, "Scan cancelled");
        } else {
            warn!(
                scan_id = %outcome.scan_id,
                client_id = %outcome.client_id,
                error_kind = %kind,
                "Scan failed"
            );
        }
    }
}
