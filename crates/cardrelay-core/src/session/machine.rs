//! Pure scan-session state machine.
//!
//! [`transition`] maps `(state, event)` to the next state and the single
//! side effect the runtime must perform. It does no I/O and never looks at a
//! clock, so every ordering of hardware callbacks, deadlines and cancellation
//! can be replayed in a unit test.

use tracing::debug;

use crate::card_id::format_card_id;
use crate::reader::{InvalidationReason, ReaderError, ReaderEvent};
use crate::types::{CardTechnology, ErrorKind, ScanOutcome, SessionPhase, SessionRequest, Target};

/// Which cards a session accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Required card technology, or `None` to accept any.
    pub expected_technology: Option<CardTechnology>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            expected_technology: Some(CardTechnology::Felica),
        }
    }
}

impl SessionPolicy {
    /// Returns `true` if a card of `technology` may be read.
    #[must_use]
    pub fn accepts(&self, technology: CardTechnology) -> bool {
        self.expected_technology
            .map_or(true, |expected| expected == technology)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// A card identifier was read and formatted.
    Succeeded {
        /// Formatted card identifier, never empty.
        card_id: String,
    },
    /// The session failed.
    Failed(ErrorKind),
    /// The session was aborted.
    Cancelled,
}

impl Terminal {
    /// Build the single outcome this session emits.
    #[must_use]
    pub fn outcome(&self, request: &SessionRequest) -> ScanOutcome {
        match self {
            Self::Succeeded { card_id } => ScanOutcome::succeeded(request, card_id.clone()),
            Self::Failed(kind) => ScanOutcome::failed(request, *kind),
            Self::Cancelled => ScanOutcome::failed(request, ErrorKind::Cancelled),
        }
    }

    /// Reason handed to the reader when tearing down.
    #[must_use]
    pub const fn teardown_reason(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "scan complete",
            Self::Failed(kind) => kind.message(),
            Self::Cancelled => "scan cancelled",
        }
    }
}

/// Session state, including the data each phase needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not started.
    Idle,
    /// Waiting for a discovery event.
    Polling,
    /// Connecting to the single discovered card.
    Connecting {
        /// The card being connected to.
        target: Target,
    },
    /// Reading the identifier of the connected card.
    Extracting {
        /// The connected card.
        target: Target,
    },
    /// No further transition is possible.
    Finished(Terminal),
}

impl SessionState {
    /// Observable phase of this state.
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        match self {
            Self::Idle => SessionPhase::Idle,
            Self::Polling => SessionPhase::Polling,
            Self::Connecting { .. } => SessionPhase::Connecting,
            Self::Extracting { .. } => SessionPhase::Extracting,
            Self::Finished(Terminal::Succeeded { .. }) => SessionPhase::Succeeded,
            Self::Finished(Terminal::Failed(kind)) => SessionPhase::Failed(*kind),
            Self::Finished(Terminal::Cancelled) => SessionPhase::Cancelled,
        }
    }

    /// Returns `true` once the session has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `start()` was called.
    Start,
    /// The reader is absent, disabled, or refused to poll.
    ReaderUnavailable,
    /// One discovery event with all cards seen in it.
    TargetsDiscovered(Vec<Target>),
    /// The hardware ended its session on its own.
    Invalidated(InvalidationReason),
    /// `connect` succeeded.
    Connected,
    /// `connect` failed.
    ConnectFailed(ReaderError),
    /// `read_identifier` returned bytes.
    IdentifierRead(Vec<u8>),
    /// `read_identifier` failed.
    ReadFailed(ReaderError),
    /// The session deadline fired.
    DeadlineElapsed,
    /// External cancellation.
    Cancelled,
}

impl From<ReaderEvent> for SessionEvent {
    fn from(event: ReaderEvent) -> Self {
        match event {
            ReaderEvent::TargetsDiscovered(targets) => Self::TargetsDiscovered(targets),
            ReaderEvent::Invalidated(reason) => Self::Invalidated(reason),
        }
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Nothing to do.
    None,
    /// Check availability and start discovery.
    BeginPolling,
    /// Connect to the target.
    Connect(Target),
    /// Read the target's identifier.
    Extract(Target),
    /// Tear down the hardware session and emit the outcome.
    Teardown(Terminal),
}

fn finish(terminal: Terminal) -> (SessionState, Effect) {
    (
        SessionState::Finished(terminal.clone()),
        Effect::Teardown(terminal),
    )
}

fn fail(kind: ErrorKind) -> (SessionState, Effect) {
    finish(Terminal::Failed(kind))
}

/// Compute the next state.
///
/// Events that do not apply to the current state leave it unchanged and
/// request no effect. A finished session ignores everything.
#[must_use]
pub fn transition(
    state: SessionState,
    event: SessionEvent,
    policy: &SessionPolicy,
) -> (SessionState, Effect) {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (state @ S::Finished(_), _) => (state, Effect::None),

        (S::Idle, E::Start) => (S::Polling, Effect::BeginPolling),

        // Session-wide events: deadline and aborts apply in every active state.
        (_, E::Cancelled) => finish(Terminal::Cancelled),
        (S::Idle, _) => (S::Idle, Effect::None),
        (_, E::DeadlineElapsed) => fail(ErrorKind::Timeout),
        (state, E::Invalidated(reason)) => match reason {
            InvalidationReason::UserCanceled => finish(Terminal::Cancelled),
            InvalidationReason::SessionTimeout => fail(ErrorKind::Timeout),
            InvalidationReason::Other(_) if matches!(state, S::Polling) => {
                fail(ErrorKind::HardwareUnavailable)
            }
            InvalidationReason::Other(_) => fail(ErrorKind::ReadError),
        },

        (S::Polling, E::ReaderUnavailable) => fail(ErrorKind::HardwareUnavailable),
        (S::Polling, E::TargetsDiscovered(mut targets)) => match targets.len() {
            0 => (S::Polling, Effect::None),
            1 => {
                let target = targets.remove(0);
                (
                    S::Connecting {
                        target: target.clone(),
                    },
                    Effect::Connect(target),
                )
            }
            _ => fail(ErrorKind::MultipleTargets),
        },

        (S::Connecting { target }, E::Connected) => {
            if policy.accepts(target.technology) {
                (
                    S::Extracting {
                        target: target.clone(),
                    },
                    Effect::Extract(target),
                )
            } else {
                fail(ErrorKind::UnsupportedTarget)
            }
        }
        (S::Connecting { .. }, E::ConnectFailed(_)) => fail(ErrorKind::ReadError),

        (S::Extracting { target }, E::IdentifierRead(bytes)) => {
            match format_card_id(target.technology, &bytes) {
                Some(card_id) => finish(Terminal::Succeeded { card_id }),
                None => fail(ErrorKind::ReadError),
            }
        }
        (S::Extracting { .. }, E::ReadFailed(_)) => fail(ErrorKind::ReadError),

        (state, _) => (state, Effect::None),
    }
}

/// Owns the current state and applies events one at a time.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    policy: SessionPolicy,
}

impl SessionMachine {
    /// A machine in [`SessionState::Idle`].
    #[must_use]
    pub const fn new(policy: SessionPolicy) -> Self {
        Self {
            state: SessionState::Idle,
            policy,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Feed one event and return the effect to perform.
    pub fn apply(&mut self, event: SessionEvent) -> Effect {
        let before = self.state.phase();
        let label = event_label(&event);
        let state = std::mem::replace(&mut self.state, SessionState::Idle);
        let (next, effect) = transition(state, event, &self.policy);
        self.state = next;

        let after = self.state.phase();
        if before == after && effect == Effect::None {
            debug!(event = label, phase = ?before, "Event ignored");
        } else {
            debug!(event = label, from = ?before, to = ?after, "Session transition");
        }
        effect
    }
}

const fn event_label(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::Start => "start",
        SessionEvent::ReaderUnavailable => "reader_unavailable",
        SessionEvent::TargetsDiscovered(_) => "targets_discovered",
        SessionEvent::Invalidated(_) => "invalidated",
        SessionEvent::Connected => "connected",
        SessionEvent::ConnectFailed(_) => "connect_failed",
        SessionEvent::IdentifierRead(_) => "identifier_read",
        SessionEvent::ReadFailed(_) => "read_failed",
        SessionEvent::DeadlineElapsed => "deadline_elapsed",
        SessionEvent::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn felica() -> Target {
        Target::new("reader-0", CardTechnology::Felica)
    }

    fn machine() -> SessionMachine {
        SessionMachine::new(SessionPolicy::default())
    }

    fn polling() -> SessionMachine {
        let mut m = machine();
        assert_eq!(m.apply(SessionEvent::Start), Effect::BeginPolling);
        m
    }

    #[test]
    fn test_happy_path() {
        let mut m = polling();
        assert_eq!(
            m.apply(SessionEvent::TargetsDiscovered(vec![felica()])),
            Effect::Connect(felica())
        );
        assert_eq!(m.phase(), SessionPhase::Connecting);
        assert_eq!(m.apply(SessionEvent::Connected), Effect::Extract(felica()));
        assert_eq!(m.phase(), SessionPhase::Extracting);

        let effect = m.apply(SessionEvent::IdentifierRead(vec![0x01, 0xab]));
        assert_eq!(
            effect,
            Effect::Teardown(Terminal::Succeeded {
                card_id: "felica:01AB".into()
            })
        );
        assert_eq!(m.phase(), SessionPhase::Succeeded);
    }

    #[test]
    fn test_multiple_targets_fail_without_connect() {
        let mut m = polling();
        let effect = m.apply(SessionEvent::TargetsDiscovered(vec![
            felica(),
            Target::new("reader-1", CardTechnology::Felica),
        ]));
        assert_eq!(
            effect,
            Effect::Teardown(Terminal::Failed(ErrorKind::MultipleTargets))
        );
    }

    #[test]
    fn test_empty_discovery_keeps_polling() {
        let mut m = polling();
        assert_eq!(
            m.apply(SessionEvent::TargetsDiscovered(Vec::new())),
            Effect::None
        );
        assert_eq!(m.phase(), SessionPhase::Polling);
    }

    #[test]
    fn test_unsupported_technology_after_connect() {
        let mut m = polling();
        let card = Target::new("reader-0", CardTechnology::Iso14443a);
        assert_eq!(
            m.apply(SessionEvent::TargetsDiscovered(vec![card.clone()])),
            Effect::Connect(card)
        );
        assert_eq!(
            m.apply(SessionEvent::Connected),
            Effect::Teardown(Terminal::Failed(ErrorKind::UnsupportedTarget))
        );
    }

    #[test]
    fn test_any_technology_policy() {
        let mut m = SessionMachine::new(SessionPolicy {
            expected_technology: None,
        });
        m.apply(SessionEvent::Start);
        let card = Target::new("reader-0", CardTechnology::Iso15693);
        m.apply(SessionEvent::TargetsDiscovered(vec![card.clone()]));
        assert_eq!(m.apply(SessionEvent::Connected), Effect::Extract(card));
    }

    #[test]
    fn test_empty_identifier_is_read_error() {
        let mut m = polling();
        m.apply(SessionEvent::TargetsDiscovered(vec![felica()]));
        m.apply(SessionEvent::Connected);
        assert_eq!(
            m.apply(SessionEvent::IdentifierRead(Vec::new())),
            Effect::Teardown(Terminal::Failed(ErrorKind::ReadError))
        );
    }

    #[test]
    fn test_reader_unavailable() {
        let mut m = polling();
        assert_eq!(
            m.apply(SessionEvent::ReaderUnavailable),
            Effect::Teardown(Terminal::Failed(ErrorKind::HardwareUnavailable))
        );
    }

    #[test]
    fn test_connect_and_read_failures() {
        let err = ReaderError::Communication {
            message: "lost".into(),
        };

        let mut m = polling();
        m.apply(SessionEvent::TargetsDiscovered(vec![felica()]));
        assert_eq!(
            m.apply(SessionEvent::ConnectFailed(err.clone())),
            Effect::Teardown(Terminal::Failed(ErrorKind::ReadError))
        );

        let mut m = polling();
        m.apply(SessionEvent::TargetsDiscovered(vec![felica()]));
        m.apply(SessionEvent::Connected);
        assert_eq!(
            m.apply(SessionEvent::ReadFailed(err)),
            Effect::Teardown(Terminal::Failed(ErrorKind::ReadError))
        );
    }

    #[test]
    fn test_deadline_from_every_active_state() {
        let active = [
            SessionState::Polling,
            SessionState::Connecting { target: felica() },
            SessionState::Extracting { target: felica() },
        ];
        for state in active {
            let (next, effect) = transition(
                state,
                SessionEvent::DeadlineElapsed,
                &SessionPolicy::default(),
            );
            assert_eq!(next.phase(), SessionPhase::Failed(ErrorKind::Timeout));
            assert_eq!(effect, Effect::Teardown(Terminal::Failed(ErrorKind::Timeout)));
        }
    }

    #[test]
    fn test_invalidation_mapping() {
        let policy = SessionPolicy::default();
        let cases = [
            (
                SessionState::Polling,
                InvalidationReason::UserCanceled,
                SessionPhase::Cancelled,
            ),
            (
                SessionState::Polling,
                InvalidationReason::SessionTimeout,
                SessionPhase::Failed(ErrorKind::Timeout),
            ),
            (
                SessionState::Polling,
                InvalidationReason::Other("unplugged".into()),
                SessionPhase::Failed(ErrorKind::HardwareUnavailable),
            ),
            (
                SessionState::Extracting { target: felica() },
                InvalidationReason::Other("unplugged".into()),
                SessionPhase::Failed(ErrorKind::ReadError),
            ),
        ];
        for (state, reason, expected) in cases {
            let (next, _) = transition(state, SessionEvent::Invalidated(reason), &policy);
            assert_eq!(next.phase(), expected);
        }
    }

    #[test]
    fn test_terminal_state_ignores_late_events() {
        let mut m = polling();
        m.apply(SessionEvent::DeadlineElapsed);
        assert!(m.state().is_terminal());

        for event in [
            SessionEvent::TargetsDiscovered(vec![felica()]),
            SessionEvent::Connected,
            SessionEvent::IdentifierRead(vec![1, 2, 3]),
            SessionEvent::Cancelled,
            SessionEvent::DeadlineElapsed,
        ] {
            assert_eq!(m.apply(event), Effect::None);
        }
        assert_eq!(m.phase(), SessionPhase::Failed(ErrorKind::Timeout));
    }

    #[test]
    fn test_out_of_order_callbacks_are_ignored() {
        let mut m = polling();
        assert_eq!(m.apply(SessionEvent::Connected), Effect::None);
        assert_eq!(m.apply(SessionEvent::IdentifierRead(vec![1])), Effect::None);
        assert_eq!(m.phase(), SessionPhase::Polling);
    }

    #[test]
    fn test_cancel_before_start() {
        let (next, effect) = transition(
            SessionState::Idle,
            SessionEvent::Cancelled,
            &SessionPolicy::default(),
        );
        assert_eq!(next.phase(), SessionPhase::Cancelled);
        assert_eq!(effect, Effect::Teardown(Terminal::Cancelled));
    }

    #[test]
    fn test_outcome_from_terminal() {
        let request = SessionRequest {
            scan_id: "abc".into(),
            client_id: "xyz".into(),
            callback_hint: None,
        };
        let outcome = Terminal::Succeeded {
            card_id: "felica:01".into(),
        }
        .outcome(&request);
        assert!(outcome.success);
        assert_eq!(outcome.card_id, "felica:01");

        let outcome = Terminal::Cancelled.outcome(&request);
        assert!(outcome.is_cancelled());
        assert!(outcome.card_id.is_empty());
    }
}
