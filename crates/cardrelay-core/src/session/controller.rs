//! Scan session runtime.
//!
//! [`ScanSessionController::start`] claims the reader and spawns one task per
//! session. That task is the only place the state machine is advanced: the
//! cancellation token, the deadline, the in-flight hardware call and the
//! reader's event channel are multiplexed in one `select!`, so transitions
//! are strictly sequential no matter how the hardware callbacks interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::machine::{Effect, SessionEvent, SessionMachine, SessionPolicy};
use crate::config::SessionConfig;
use crate::reader::{CardReader, ReaderEvent};
use crate::types::{ScanOutcome, SessionPhase, SessionRequest, Target};

/// Capacity of the reader event channel.
const EVENT_BUFFER: usize = 16;

/// Errors returned by the session controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Another session owns the reader.
    #[error("A scan session is already active")]
    AlreadyActive,

    /// `start` was called outside a Tokio runtime.
    #[error("No async runtime available to run the scan session")]
    NoRuntime,

    /// The session task ended without producing an outcome.
    #[error("Scan session ended without an outcome")]
    Aborted,
}

/// Result type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Timing and policy for every session started by a controller.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Deadline measured from entry to polling.
    pub timeout: Duration,
    /// Upper bound on reader teardown.
    pub teardown_grace: Duration,
    /// Accepted card technology.
    pub policy: SessionPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            teardown_grace: Duration::from_secs(2),
            policy: SessionPolicy::default(),
        }
    }
}

impl SessionSettings {
    /// Build settings from the `[session]` configuration section.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            policy: SessionPolicy {
                expected_technology: config.expected_technology.technology(),
            },
            ..Self::default()
        }
    }
}

/// Runs scan sessions against a single reader, one at a time.
pub struct ScanSessionController<R> {
    reader: Arc<Mutex<R>>,
    reader_kind: &'static str,
    active: Arc<AtomicBool>,
    settings: SessionSettings,
}

impl<R> Clone for ScanSessionController<R> {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            reader_kind: self.reader_kind,
            active: Arc::clone(&self.active),
            settings: self.settings.clone(),
        }
    }
}

impl<R> std::fmt::Debug for ScanSessionController<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSessionController")
            .field("reader_kind", &self.reader_kind)
            .field("active", &self.is_active())
            .field("settings", &self.settings)
            .finish()
    }
}

impl<R: CardReader> ScanSessionController<R> {
    /// Take ownership of `reader`.
    pub fn new(reader: R, settings: SessionSettings) -> Self {
        Self {
            reader_kind: reader.kind(),
            reader: Arc::new(Mutex::new(reader)),
            active: Arc::new(AtomicBool::new(false)),
            settings,
        }
    }

    /// Start a session for `request`.
    ///
    /// Returns immediately; the session runs on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyActive`] while another session runs. The
    ///   request is rejected, never queued.
    /// - [`SessionError::NoRuntime`] when called outside a Tokio runtime.
    pub fn start(&self, request: SessionRequest) -> SessionResult<SessionHandle> {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::AlreadyActive);
        }
        let active = ActiveGuard(Arc::clone(&self.active));

        // The previous session clears `active` only after releasing the
        // reader, so this lock is free whenever the flag was.
        let reader = Arc::clone(&self.reader)
            .try_lock_owned()
            .map_err(|_| SessionError::AlreadyActive)?;

        let session_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let span = info_span!("scan_session", %session_id, scan_id = %request.scan_id);
        let task = SessionTask {
            request: request.clone(),
            settings: self.settings.clone(),
            cancel: cancel.clone(),
            phase: phase_tx,
        };
        runtime.spawn(
            async move {
                let outcome = task.run(reader, active).await;
                // The receiver may be gone; the outcome is logged either way.
                let _ = outcome_tx.send(outcome);
            }
            .instrument(span),
        );

        Ok(SessionHandle {
            session_id,
            scan_id: request.scan_id,
            cancel,
            phase: phase_rx,
            outcome: outcome_rx,
        })
    }
}

impl<R> ScanSessionController<R> {
    /// Returns `true` while a session owns the reader.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Backend name of the owned reader.
    #[must_use]
    pub const fn reader_kind(&self) -> &'static str {
        self.reader_kind
    }

    /// Settings applied to new sessions.
    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}

/// Clears the controller's `active` flag when dropped, including when the
/// session task is aborted.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Caller's view of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: Uuid,
    scan_id: String,
    cancel: CancellationToken,
    phase: watch::Receiver<SessionPhase>,
    outcome: oneshot::Receiver<ScanOutcome>,
}

impl SessionHandle {
    /// Unique id of this session.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Correlation token of the request being served.
    #[must_use]
    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    /// Request cancellation. No-op once the session has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the session (and by a delivery started for it).
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Latest published phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Wait for the session's single outcome.
    ///
    /// # Errors
    ///
    /// [`SessionError::Aborted`] if the session task was dropped before it
    /// finished (runtime shutdown).
    pub async fn outcome(self) -> SessionResult<ScanOutcome> {
        self.outcome.await.map_err(|_| SessionError::Aborted)
    }
}

/// Hardware operation the session is waiting on.
#[derive(Debug)]
enum PendingOp {
    BeginPolling,
    Connect(Target),
    Extract(Target),
}

/// What woke the event loop.
enum Step {
    Event(SessionEvent),
    Operation(Option<SessionEvent>),
}

struct SessionTask {
    request: SessionRequest,
    settings: SessionSettings,
    cancel: CancellationToken,
    phase: watch::Sender<SessionPhase>,
}

impl SessionTask {
    async fn run<R: CardReader>(
        self,
        mut reader: OwnedMutexGuard<R>,
        active: ActiveGuard,
    ) -> ScanOutcome {
        let mut machine = SessionMachine::new(self.settings.policy.clone());
        let (event_tx, mut events) = mpsc::channel::<ReaderEvent>(EVENT_BUFFER);
        let deadline = tokio::time::sleep(self.settings.timeout);
        tokio::pin!(deadline);

        info!(
            client_id = %self.request.client_id,
            reader = reader.kind(),
            timeout_ms = self.settings.timeout.as_millis(),
            "Scan session started"
        );

        let mut pending: Option<PendingOp> = None;
        let mut effect = machine.apply(SessionEvent::Start);

        let terminal = loop {
            match effect {
                Effect::None => {}
                Effect::BeginPolling => pending = Some(PendingOp::BeginPolling),
                Effect::Connect(target) => pending = Some(PendingOp::Connect(target)),
                Effect::Extract(target) => pending = Some(PendingOp::Extract(target)),
                Effect::Teardown(terminal) => break terminal,
            }
            self.publish(machine.phase());

            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Step::Event(SessionEvent::Cancelled),
                () = &mut deadline => Step::Event(SessionEvent::DeadlineElapsed),
                event = perform(&mut *reader, pending.as_ref(), &event_tx) => Step::Operation(event),
                Some(event) = events.recv(), if pending.is_none() => Step::Event(event.into()),
            };

            effect = match step {
                Step::Event(event) => machine.apply(event),
                Step::Operation(event) => {
                    pending = None;
                    event.map_or(Effect::None, |event| machine.apply(event))
                }
            };
        };
        let outcome = terminal.outcome(&self.request);
        self.publish(machine.phase());

        // Stop listening before teardown so nothing the reader sends while
        // shutting down is observed.
        drop(events);
        let reason = terminal.teardown_reason();
        if tokio::time::timeout(self.settings.teardown_grace, reader.invalidate(reason))
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.settings.teardown_grace.as_millis(),
                "Reader teardown exceeded grace period"
            );
        }
        drop(reader);
        drop(active);

        info!(
            success = outcome.success,
            error_kind = ?outcome.error_kind,
            card_id = %outcome.card_id,
            "Scan session finished"
        );
        outcome
    }

    fn publish(&self, phase: SessionPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }
}

/// Run the pending hardware operation, or wait forever if there is none.
async fn perform<R: CardReader>(
    reader: &mut R,
    op: Option<&PendingOp>,
    events: &mpsc::Sender<ReaderEvent>,
) -> Option<SessionEvent> {
    let Some(op) = op else {
        return std::future::pending().await;
    };

    match op {
        PendingOp::BeginPolling => {
            if !reader.is_available().await {
                return Some(SessionEvent::ReaderUnavailable);
            }
            match reader.begin_polling(events.clone()).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(error = %e, "Reader refused to start polling");
                    Some(SessionEvent::ReaderUnavailable)
                }
            }
        }
        PendingOp::Connect(target) => Some(match reader.connect(target).await {
            Ok(()) => SessionEvent::Connected,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                SessionEvent::ConnectFailed(e)
            }
        }),
        PendingOp::Extract(target) => Some(match reader.read_identifier(target).await {
            Ok(bytes) => SessionEvent::IdentifierRead(bytes),
            Err(e) => {
                warn!(error = %e, "Identifier read failed");
                SessionEvent::ReadFailed(e)
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TechnologyFilter;
    use crate::reader::{InvalidationReason, MockReader};
    use crate::types::{CardTechnology, ErrorKind};

    fn request() -> SessionRequest {
        SessionRequest {
            scan_id: "abc123".into(),
            client_id: "xyz".into(),
            callback_hint: None,
        }
    }

    fn felica(handle: &str) -> Target {
        Target::new(handle, CardTechnology::Felica)
    }

    fn controller(reader: MockReader) -> ScanSessionController<MockReader> {
        ScanSessionController::new(reader, SessionSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_read() {
        let reader = MockReader::new()
            .with_card(Duration::from_millis(300), felica("slot-0"))
            .with_identifier(vec![0x01, 0x27, 0x00, 0x5d, 0x2a, 0x1b, 0x3c, 0x4d]);
        let stats = reader.stats();
        let controller = controller(reader);

        let handle = controller.start(request()).unwrap();
        assert!(controller.is_active());
        let outcome = handle.outcome().await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.card_id, "felica:0127005D2A1B3C4D");
        assert_eq!(outcome.scan_id, "abc123");
        assert_eq!(stats.invalidate_calls(), 1);
        assert!(!controller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let controller = controller(MockReader::new());
        let first = controller.start(request()).unwrap();

        assert_eq!(
            controller.start(request()).unwrap_err(),
            SessionError::AlreadyActive
        );

        first.cancel();
        let outcome = first.outcome().await.unwrap();
        assert!(outcome.is_cancelled());

        // The reader is free again once the outcome is out.
        let second = controller.start(request()).unwrap();
        second.cancel();
        second.outcome().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_targets_never_connect() {
        let reader = MockReader::new().with_event(
            Duration::from_millis(100),
            ReaderEvent::TargetsDiscovered(vec![felica("slot-0"), felica("slot-1")]),
        );
        let stats = reader.stats();
        let controller = controller(reader);

        let outcome = controller.start(request()).unwrap().outcome().await.unwrap();

        assert_eq!(outcome.error_kind, Some(ErrorKind::MultipleTargets));
        assert!(outcome.card_id.is_empty());
        assert_eq!(stats.connect_calls(), 0);
        assert_eq!(stats.invalidate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ignores_late_card() {
        let reader = MockReader::new()
            .with_card(Duration::from_secs(10), felica("slot-0"))
            .with_identifier(vec![0x01]);
        let stats = reader.stats();
        let controller = controller(reader);

        let handle = controller.start(request()).unwrap();
        let mut phases = handle.subscribe();
        let outcome = handle.outcome().await.unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));

        // Let the late card arrive; nothing may react to it.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stats.connect_calls(), 0);
        assert_eq!(stats.invalidate_calls(), 1);
        assert_eq!(
            *phases.borrow_and_update(),
            SessionPhase::Failed(ErrorKind::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_connect() {
        let reader = MockReader::new()
            .with_card(Duration::from_millis(100), felica("slot-0"))
            .with_connect_delay(Duration::from_secs(30));
        let stats = reader.stats();
        let controller = controller(reader);

        let outcome = controller.start(request()).unwrap().outcome().await.unwrap();

        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(stats.connect_calls(), 1);
        assert_eq!(stats.read_calls(), 0);
        assert_eq!(stats.invalidate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hardware_unavailable() {
        let reader = MockReader::new().with_available(false);
        let stats = reader.stats();
        let controller = controller(reader);

        let outcome = controller.start(request()).unwrap().outcome().await.unwrap();

        assert_eq!(outcome.error_kind, Some(ErrorKind::HardwareUnavailable));
        assert_eq!(stats.begin_calls(), 0);
        assert_eq!(stats.invalidate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_card() {
        let reader = MockReader::new()
            .with_card(
                Duration::from_millis(50),
                Target::new("slot-0", CardTechnology::Iso14443a),
            )
            .with_identifier(vec![0x04, 0xa2]);
        let stats = reader.stats();
        let controller = controller(reader);

        let outcome = controller.start(request()).unwrap().outcome().await.unwrap();

        assert_eq!(outcome.error_kind, Some(ErrorKind::UnsupportedTarget));
        assert_eq!(stats.connect_calls(), 1);
        assert_eq!(stats.read_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failures() {
        let reader = MockReader::new()
            .with_card(Duration::from_millis(50), felica("slot-0"))
            .with_read_error("checksum mismatch");
        let outcome = controller(reader)
            .start(request())
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::ReadError));

        // An empty identifier is not a successful read either.
        let reader = MockReader::new().with_card(Duration::from_millis(50), felica("slot-0"));
        let outcome = controller(reader)
            .start(request())
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::ReadError));
        assert!(!outcome.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_dismissal_cancels() {
        let reader = MockReader::new().with_event(
            Duration::from_millis(200),
            ReaderEvent::Invalidated(InvalidationReason::UserCanceled),
        );
        let stats = reader.stats();

        let outcome = controller(reader)
            .start(request())
            .unwrap()
            .outcome()
            .await
            .unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(stats.invalidate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phases_are_published() {
        let reader = MockReader::new()
            .with_card(Duration::from_millis(100), felica("slot-0"))
            .with_connect_delay(Duration::from_millis(100))
            .with_identifier(vec![0xaa]);
        let controller = controller(reader);
        let handle = controller.start(request()).unwrap();
        let mut phases = handle.subscribe();

        let mut seen = Vec::new();
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            seen.push(phase);
            if phase.is_terminal() {
                break;
            }
        }

        assert_eq!(seen.first(), Some(&SessionPhase::Polling));
        assert!(seen.contains(&SessionPhase::Connecting));
        assert_eq!(seen.last(), Some(&SessionPhase::Succeeded));
        assert!(handle.outcome().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_outcome_is_stamped_before_teardown() {
        let reader = MockReader::new()
            .with_card(Duration::from_millis(10), felica("slot-0"))
            .with_identifier(vec![0xaa])
            .with_teardown_delay(Duration::from_millis(300));
        let settings = SessionSettings {
            teardown_grace: Duration::from_secs(1),
            ..SessionSettings::default()
        };
        let controller = ScanSessionController::new(reader, settings);
        let handle = controller.start(request()).unwrap();

        let mut phases = handle.subscribe();
        phases
            .wait_for(|phase| phase.is_terminal())
            .await
            .unwrap();
        let terminal_at = chrono::Utc::now().timestamp_millis();

        let outcome = handle.outcome().await.unwrap();
        assert!(outcome.success);
        assert!(
            outcome.timestamp_millis <= terminal_at,
            "stamped {} after the terminal phase at {terminal_at}",
            outcome.timestamp_millis
        );
    }

    #[test]
    fn test_settings_accept_any_technology() {
        let config = SessionConfig {
            expected_technology: TechnologyFilter::Any,
            ..SessionConfig::default()
        };
        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.policy.expected_technology, None);
        assert!(settings.policy.accepts(CardTechnology::Iso15693));

        let settings = SessionSettings::from_config(&SessionConfig::default());
        assert!(!settings.policy.accepts(CardTechnology::Iso15693));
    }

    #[test]
    fn test_start_requires_runtime() {
        let controller = controller(MockReader::new());
        assert_eq!(
            controller.start(request()).unwrap_err(),
            SessionError::NoRuntime
        );
        assert!(!controller.is_active());
    }
}
