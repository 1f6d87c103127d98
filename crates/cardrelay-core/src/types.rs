//! Shared types and OpenAPI schemas.
//!
//! This module contains the data model that flows through a scan session:
//! the parsed [`SessionRequest`], the single [`ScanOutcome`] a session emits,
//! and the [`ErrorKind`] taxonomy shared by the session controller and the
//! delivery client.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A validated activation request.
///
/// Created by [`ActivationParser`](crate::activation::ActivationParser) and
/// consumed exactly once by the session controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionRequest {
    /// Caller-issued correlation token, unique per activation.
    #[schema(example = "abc123")]
    pub scan_id: String,

    /// Identity of the originating client.
    #[schema(example = "xyz")]
    pub client_id: String,

    /// Optional hint telling the notifier how to reach the originating UI.
    #[schema(example = "ws")]
    pub callback_hint: Option<String>,
}

/// The single terminal result of one scan session.
///
/// `card_id` is non-empty if and only if `success` is `true`. Use
/// [`ScanOutcome::succeeded`] and [`ScanOutcome::failed`] to keep that
/// invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "scan_id": "abc123",
    "client_id": "xyz",
    "card_id": "felica:0127005D2A1B3C4D",
    "success": true,
    "error_kind": null,
    "timestamp_millis": 1_760_000_000_000_i64
}))]
pub struct ScanOutcome {
    /// Correlation token copied from the request.
    pub scan_id: String,

    /// Client identity copied from the request.
    pub client_id: String,

    /// Formatted card identifier, empty on failure.
    pub card_id: String,

    /// Whether a card identifier was read.
    pub success: bool,

    /// Why the session failed, if it did.
    pub error_kind: Option<ErrorKind>,

    /// When the terminal state was reached (Unix epoch, milliseconds).
    pub timestamp_millis: i64,
}

impl ScanOutcome {
    /// Build a successful outcome for `request`.
    #[must_use]
    pub fn succeeded(request: &SessionRequest, card_id: String) -> Self {
        debug_assert!(!card_id.is_empty(), "successful outcome needs a card id");
        Self {
            scan_id: request.scan_id.clone(),
            client_id: request.client_id.clone(),
            card_id,
            success: true,
            error_kind: None,
            timestamp_millis: Utc::now().timestamp_millis(),
        }
    }

    /// Build a failed (or cancelled) outcome for `request`.
    #[must_use]
    pub fn failed(request: &SessionRequest, kind: ErrorKind) -> Self {
        Self {
            scan_id: request.scan_id.clone(),
            client_id: request.client_id.clone(),
            card_id: String::new(),
            success: false,
            error_kind: Some(kind),
            timestamp_millis: Utc::now().timestamp_millis(),
        }
    }

    /// Returns `true` if the session was deliberately aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }
}

/// Failure classification shared by the session and delivery layers.
///
/// Retryability is a static property of the kind, independent of any HTTP
/// status, so local failures classify the same way as network ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The reader is absent or disabled.
    HardwareUnavailable,
    /// More than one card was presented in a single discovery event.
    MultipleTargets,
    /// The card is not of the expected technology.
    UnsupportedTarget,
    /// Communication with the card failed after connecting.
    ReadError,
    /// No card was read before the session deadline.
    Timeout,
    /// The backend could not be reached.
    TransportError,
    /// The backend did not answer within the request timeout.
    RequestTimeout,
    /// The backend answered with a 5xx status.
    ServerError,
    /// The backend rejected the submission with a 4xx status.
    ClientError,
    /// The submission could not be built locally.
    InvalidRequest,
    /// Deliberate abort, not a failure.
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if a delivery failing with this kind may be retried.
    #[inline]
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransportError | Self::RequestTimeout | Self::ServerError
        )
    }

    /// Returns `true` for failures of the hardware read itself.
    ///
    /// These are never retried automatically; the caller must start a new
    /// session.
    #[inline]
    #[must_use]
    pub const fn is_session_failure(self) -> bool {
        matches!(
            self,
            Self::HardwareUnavailable
                | Self::MultipleTargets
                | Self::UnsupportedTarget
                | Self::ReadError
                | Self::Timeout
        )
    }

    /// Machine-readable code, identical to the serialized form.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::HardwareUnavailable => "hardware_unavailable",
            Self::MultipleTargets => "multiple_targets",
            Self::UnsupportedTarget => "unsupported_target",
            Self::ReadError => "read_error",
            Self::Timeout => "timeout",
            Self::TransportError => "transport_error",
            Self::RequestTimeout => "request_timeout",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::InvalidRequest => "invalid_request",
            Self::Cancelled => "cancelled",
        }
    }

    /// Human-readable message, sent to the backend as `error_message`.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::HardwareUnavailable => "Card reader is not available",
            Self::MultipleTargets => "More than one card detected. Present a single card.",
            Self::UnsupportedTarget => "Card type is not supported",
            Self::ReadError => "Failed to read the card",
            Self::Timeout => "No card was presented in time",
            Self::TransportError => "Could not reach the server",
            Self::RequestTimeout => "The server did not respond in time",
            Self::ServerError => "The server reported an internal error",
            Self::ClientError => "The server rejected the scan",
            Self::InvalidRequest => "The scan submission could not be built",
            Self::Cancelled => "Scan was cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Observable phase of a scan session.
///
/// This is the snapshot published to host `on_state_changed` observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "phase", content = "error_kind", rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session has started yet.
    Idle,
    /// Waiting for a card to be presented.
    Polling,
    /// Connecting to the single detected card.
    Connecting,
    /// Reading the card identifier.
    Extracting,
    /// A card identifier was read.
    Succeeded,
    /// The session ended with a failure.
    Failed(ErrorKind),
    /// The session was aborted.
    Cancelled,
}

impl SessionPhase {
    /// Returns `true` once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Cancelled)
    }
}

/// Contactless card technology, as reported by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CardTechnology {
    /// Sony FeliCa (NFC-F).
    Felica,
    /// ISO/IEC 14443 Type A (NFC-A, MIFARE).
    Iso14443a,
    /// ISO/IEC 14443 Type B (NFC-B).
    Iso14443b,
    /// ISO/IEC 15693 vicinity cards (NFC-V).
    Iso15693,
    /// The reader could not tell.
    Unknown,
}

impl CardTechnology {
    /// Fixed prefix identifying the technology in a formatted card id.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Felica => "felica",
            Self::Iso14443a => "iso14443a",
            Self::Iso14443b => "iso14443b",
            Self::Iso15693 => "iso15693",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CardTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A card detected by the reader during one discovery event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Reader-specific handle (PC/SC reader name, mock slot, ...).
    pub handle: String,

    /// Technology the reader reported for this card.
    pub technology: CardTechnology,
}

impl Target {
    /// Create a target.
    pub fn new(handle: impl Into<String>, technology: CardTechnology) -> Self {
        Self {
            handle: handle.into(),
            technology,
        }
    }
}
