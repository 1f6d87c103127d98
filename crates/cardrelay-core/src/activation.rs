//! Activation request parsing.
//!
//! A web client starts a scan by opening an activation URI of the form
//! `scheme://host?scan_id=<token>&client_id=<id>&callback=<hint>`.
//! Parsing is a pure function of the URI: no I/O, no side effects.

use thiserror::Error;
use url::Url;

use crate::config::ActivationConfig;
use crate::types::SessionRequest;

/// Query parameter carrying the correlation token.
pub const SCAN_ID_PARAM: &str = "scan_id";
/// Query parameter carrying the client identity.
pub const CLIENT_ID_PARAM: &str = "client_id";
/// Optional query parameter carrying the callback hint.
pub const CALLBACK_PARAM: &str = "callback";

/// Errors produced while decoding an activation URI.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivationError {
    /// The URI is not an activation for this host.
    #[error("Invalid activation: {0}")]
    InvalidActivation(#[from] InvalidReason),

    /// A required query parameter is absent or empty.
    #[error("Activation is missing required parameter '{field}'")]
    MissingField {
        /// Name of the missing parameter.
        field: &'static str,
    },
}

/// Why an activation URI was rejected before parameter parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// The URI could not be parsed at all.
    #[error("malformed URI: {0}")]
    Malformed(String),

    /// The scheme does not match the configured one.
    #[error("expected scheme '{expected}', got '{actual}'")]
    UnexpectedScheme {
        /// Configured scheme.
        expected: String,
        /// Scheme found in the URI.
        actual: String,
    },

    /// The host does not match the configured one.
    #[error("expected host '{expected}', got '{actual}'")]
    UnexpectedHost {
        /// Configured host.
        expected: String,
        /// Host found in the URI (empty if none).
        actual: String,
    },
}

/// Result type for activation parsing.
pub type ActivationResult<T> = std::result::Result<T, ActivationError>;

/// Decodes activation URIs into [`SessionRequest`]s.
#[derive(Debug, Clone)]
pub struct ActivationParser {
    scheme: String,
    host: String,
}

impl ActivationParser {
    /// Create a parser accepting `scheme://host?...`.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    /// Create a parser from the `[activation]` configuration section.
    #[must_use]
    pub fn from_config(config: &ActivationConfig) -> Self {
        Self::new(config.scheme.clone(), config.host.clone())
    }

    /// Parse and validate an activation URI.
    ///
    /// Scheme and host are checked before any parameter is looked at. When a
    /// parameter appears more than once the first occurrence wins.
    ///
    /// # Errors
    ///
    /// - [`ActivationError::InvalidActivation`] if the URI is malformed or the
    ///   scheme/host do not match.
    /// - [`ActivationError::MissingField`] if `scan_id` or `client_id` is
    ///   absent or empty.
    pub fn parse(&self, uri: &str) -> ActivationResult<SessionRequest> {
        let url = Url::parse(uri.trim()).map_err(|e| InvalidReason::Malformed(e.to_string()))?;

        if !url.scheme().eq_ignore_ascii_case(&self.scheme) {
            return Err(InvalidReason::UnexpectedScheme {
                expected: self.scheme.clone(),
                actual: url.scheme().to_string(),
            }
            .into());
        }

        let host = url.host_str().unwrap_or_default();
        if !host.eq_ignore_ascii_case(&self.host) {
            return Err(InvalidReason::UnexpectedHost {
                expected: self.host.clone(),
                actual: host.to_string(),
            }
            .into());
        }

        let mut scan_id = None;
        let mut client_id = None;
        let mut callback_hint = None;
        for (key, value) in url.query_pairs() {
            let slot = match &*key {
                SCAN_ID_PARAM => &mut scan_id,
                CLIENT_ID_PARAM => &mut client_id,
                CALLBACK_PARAM => &mut callback_hint,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        Ok(SessionRequest {
            scan_id: required(scan_id, SCAN_ID_PARAM)?,
            client_id: required(client_id, CLIENT_ID_PARAM)?,
            callback_hint: callback_hint.filter(|hint| !hint.is_empty()),
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> ActivationResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ActivationError::MissingField { field })
}
