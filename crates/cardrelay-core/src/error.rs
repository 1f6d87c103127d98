//! Unified error types for the cardrelay core library.
//!
//! Each module has its own error type ([`ActivationError`], [`SessionError`],
//! [`ReaderError`], [`DeliveryError`], [`ConfigError`], [`StoreError`]).
//! They all convert into [`CardRelayError`], which adds classification, an
//! HTTP status and a stable machine-readable code for the host API.
//!
//! Scan failures are not errors in this sense: a timed-out or rejected scan
//! still produces a [`ScanOutcome`](crate::types::ScanOutcome) carrying an
//! [`ErrorKind`](crate::types::ErrorKind). `CardRelayError` covers requests
//! that could not be served at all.
//!
//! # Example
//!
//! ```rust
//! use cardrelay_core::{ActivationParser, CardRelayError};
//!
//! let parser = ActivationParser::new("cardrelay", "scan");
//! let err: CardRelayError = parser.parse("cardrelay://scan?client_id=xyz").unwrap_err().into();
//! assert!(err.is_activation_error());
//! assert_eq!(err.http_status_code(), 400);
//! assert_eq!(err.error_code(), "MISSING_FIELD");
//! ```

use thiserror::Error;

use crate::activation::ActivationError;
use crate::config::ConfigError;
use crate::delivery::DeliveryError;
use crate::reader::ReaderError;
use crate::session::SessionError;
use crate::storage::StoreError;

/// The unified error type for all cardrelay operations.
#[derive(Debug, Error)]
pub enum CardRelayError {
    // =========================================================================
    // ACTIVATION ERRORS
    // =========================================================================
    /// The activation URI is not addressed to this host or is malformed.
    #[error("{0}")]
    InvalidActivation(String),

    /// A required activation parameter is absent.
    #[error("Activation is missing required parameter '{0}'")]
    MissingField(&'static str),

    // =========================================================================
    // SESSION ERRORS
    // =========================================================================
    /// A scan is already running. Wait for it to finish or cancel it.
    #[error("A scan session is already active. Cancel it or wait for its result.")]
    SessionActive,

    /// The session task was lost before it reported an outcome.
    #[error("Scan session failed: {0}")]
    SessionFailed(String),

    /// The card reader cannot be used.
    #[error("Card reader error: {0}")]
    Reader(#[from] ReaderError),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// Configuration could not be loaded, saved or validated.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The delivery client could not be created.
    #[error("Delivery setup failed: {0}")]
    Delivery(#[from] DeliveryError),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// The failed-delivery store could not be accessed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for cardrelay operations.
pub type Result<T> = std::result::Result<T, CardRelayError>;

impl CardRelayError {
    /// Returns `true` if the activation request itself was rejected.
    #[inline]
    #[must_use]
    pub const fn is_activation_error(&self) -> bool {
        matches!(self, Self::InvalidActivation(_) | Self::MissingField(_))
    }

    /// Returns `true` if the session could not be started or finished.
    #[inline]
    #[must_use]
    pub const fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::SessionActive | Self::SessionFailed(_) | Self::Reader(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Delivery(_))
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed activation
            Self::InvalidActivation(_) | Self::MissingField(_) => 400,

            // 409 Conflict - the reader is owned by another session
            Self::SessionActive => 409,

            // 422 Unprocessable Entity - configuration problems
            Self::Config(_) | Self::Delivery(_) => 422,

            // 503 Service Unavailable - reader hardware
            Self::Reader(_) => 503,

            // 500 Internal Server Error
            Self::SessionFailed(_) | Self::Storage(_) | Self::Io(_) => 500,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidActivation(_) => "INVALID_ACTIVATION",
            Self::MissingField(_) => "MISSING_FIELD",
            Self::SessionActive => "SESSION_ACTIVE",
            Self::SessionFailed(_) => "SESSION_FAILED",
            Self::Reader(_) => "READER_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Delivery(_) => "DELIVERY_SETUP_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<ActivationError> for CardRelayError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::InvalidActivation(reason) => {
                Self::InvalidActivation(format!("Invalid activation: {reason}"))
            }
            ActivationError::MissingField { field } => Self::MissingField(field),
        }
    }
}

impl From<SessionError> for CardRelayError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AlreadyActive => Self::SessionActive,
            SessionError::NoRuntime | SessionError::Aborted => Self::SessionFailed(err.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
