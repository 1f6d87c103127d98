//! Outcome delivery to the backend.
//!
//! [`DeliveryClient::submit`] posts one [`ScanOutcome`] per attempt and
//! classifies each result:
//!
//! | Result                         | Kind              | Retried |
//! |--------------------------------|-------------------|---------|
//! | 2xx                            | delivered         | -       |
//! | 4xx, other non-5xx statuses    | `client_error`    | no      |
//! | 5xx                            | `server_error`    | yes     |
//! | connection failure             | `transport_error` | yes     |
//! | request timeout                | `request_timeout` | yes     |
//! | request could not be built     | `invalid_request` | no      |
//!
//! Retries back off exponentially from `base_delay`, capped at `max_delay`,
//! for at most `max_attempts` attempts in total. A delivery that runs out of
//! attempts is reported as [`DeliveryResult::Exhausted`], never dropped.
//! The backend is expected to deduplicate on `scan_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use utoipa::ToSchema;

use crate::config::DeliveryConfig;
use crate::types::{ErrorKind, ScanOutcome};

// ============================================================================
// Retry policy
// ============================================================================

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. At least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from the `[delivery]` configuration section.
    #[must_use]
    pub const fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before the `retry`-th retry (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ============================================================================
// Wire format
// ============================================================================

/// JSON body posted to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryPayload {
    /// Correlation token, also the backend's dedup key.
    pub scan_id: String,
    /// Originating client.
    pub client_id: String,
    /// Formatted card identifier, empty on failure.
    pub card_id: String,
    /// Whether the session read a card.
    pub success: bool,
    /// Unix epoch milliseconds of the session's terminal state.
    pub timestamp: i64,
    /// Human-readable failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Machine-readable failure kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl From<&ScanOutcome> for DeliveryPayload {
    fn from(outcome: &ScanOutcome) -> Self {
        Self {
            scan_id: outcome.scan_id.clone(),
            client_id: outcome.client_id.clone(),
            card_id: outcome.card_id.clone(),
            success: outcome.success,
            timestamp: outcome.timestamp_millis,
            error_message: outcome.error_kind.map(|kind| kind.message().to_string()),
            error_kind: outcome.error_kind,
        }
    }
}

/// Error body returned by the backend on 4xx.
#[derive(Debug, Deserialize)]
struct BackendErrorBody {
    error: BackendError,
}

#[derive(Debug, Deserialize)]
struct BackendError {
    message: String,
}

// ============================================================================
// Transport
// ============================================================================

/// Raw HTTP answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// Status code.
    pub status: u16,
    /// Response body, possibly empty.
    pub body: String,
}

/// A request that produced no HTTP answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    /// `transport_error`, `request_timeout` or `invalid_request`.
    pub kind: ErrorKind,
    /// Underlying error.
    pub message: String,
}

/// Sends one payload and returns the raw reply.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Perform exactly one request.
    async fn post(&self, payload: &DeliveryPayload) -> Result<HttpReply, TransportFailure>;
}

/// Errors building a delivery client.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The configured endpoint is not a usable URL.
    #[error("Invalid delivery endpoint '{endpoint}': {message}")]
    InvalidEndpoint {
        /// Configured value.
        endpoint: String,
        /// Parse error.
        message: String,
    },

    /// The HTTP client could not be created.
    #[error("Failed to create HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// [`DeliveryTransport`] posting JSON over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    /// Create a transport posting to `endpoint` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Client`] if the TLS backend fails to
    /// initialize.
    pub fn new(endpoint: Url, request_timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("cardrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }

    /// Create a transport from the `[delivery]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidEndpoint`] for an unparseable
    /// endpoint.
    pub fn from_config(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let endpoint =
            Url::parse(&config.endpoint).map_err(|e| DeliveryError::InvalidEndpoint {
                endpoint: config.endpoint.clone(),
                message: e.to_string(),
            })?;
        Self::new(endpoint, Duration::from_millis(config.request_timeout_ms))
    }

    /// Target URL.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn post(&self, payload: &DeliveryPayload) -> Result<HttpReply, TransportFailure> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportFailure {
                kind: classify_transport_error(&e),
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        // The status is already decided; a body that fails to stream only
        // costs us the error message.
        let body = response.text().await.unwrap_or_default();
        Ok(HttpReply { status, body })
    }
}

fn classify_transport_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::RequestTimeout
    } else if err.is_builder() {
        ErrorKind::InvalidRequest
    } else {
        ErrorKind::TransportError
    }
}

// ============================================================================
// Results
// ============================================================================

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize, ToSchema)]
#[error("{kind}: {message}")]
pub struct DeliveryFailure {
    /// Classification.
    pub kind: ErrorKind,
    /// HTTP status, when the backend answered.
    pub status: Option<u16>,
    /// Backend or transport message.
    pub message: String,
}

impl From<TransportFailure> for DeliveryFailure {
    fn from(failure: TransportFailure) -> Self {
        Self {
            kind: failure.kind,
            status: None,
            message: failure.message,
        }
    }
}

/// Map an HTTP reply to the delivered status or a classified failure.
///
/// # Errors
///
/// Returns a [`DeliveryFailure`] for every non-2xx status.
pub fn classify_reply(reply: &HttpReply) -> Result<u16, DeliveryFailure> {
    let status = reply.status;
    let kind = match status {
        200..=299 => return Ok(status),
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::ClientError,
    };

    let message = serde_json::from_str::<BackendErrorBody>(&reply.body)
        .map(|body| body.error.message)
        .unwrap_or_else(|_| {
            StatusCode::from_u16(status)
                .ok()
                .and_then(|code| code.canonical_reason())
                .map_or_else(|| format!("HTTP {status}"), str::to_string)
        });

    Err(DeliveryFailure {
        kind,
        status: Some(status),
        message,
    })
}

/// Terminal result of one submit cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The backend accepted the outcome.
    Delivered {
        /// Attempts used, including the successful one.
        attempts: u32,
        /// 2xx status returned.
        status: u16,
    },
    /// Non-retryable failure, surfaced immediately.
    Rejected {
        /// Attempts used.
        attempts: u32,
        /// The failure.
        failure: DeliveryFailure,
    },
    /// Retryable failures until the attempt cap. Permanent.
    Exhausted {
        /// Attempts used (equals `max_attempts`).
        attempts: u32,
        /// The last failure.
        failure: DeliveryFailure,
    },
    /// Cancellation stopped the cycle.
    Abandoned {
        /// Attempts started before cancellation.
        attempts: u32,
    },
}

impl DeliveryResult {
    /// Returns `true` if the backend accepted the outcome.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Number of attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. }
            | Self::Rejected { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Abandoned { attempts } => *attempts,
        }
    }

    /// The failure, for rejected and exhausted deliveries.
    #[must_use]
    pub const fn failure(&self) -> Option<&DeliveryFailure> {
        match self {
            Self::Rejected { failure, .. } | Self::Exhausted { failure, .. } => Some(failure),
            Self::Delivered { .. } | Self::Abandoned { .. } => None,
        }
    }

    /// Error kind to report for this result, if it is not a success.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Delivered { .. } => None,
            Self::Abandoned { .. } => Some(ErrorKind::Cancelled),
            Self::Rejected { failure, .. } | Self::Exhausted { failure, .. } => Some(failure.kind),
        }
    }
}

/// Outcome handed back to the caller together with how its delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// The submitted outcome.
    pub outcome: ScanOutcome,
    /// How delivery ended.
    pub result: DeliveryResult,
}

// ============================================================================
// Client
// ============================================================================

/// State of the attempt currently in flight. Lives only inside `submit`.
#[derive(Debug, Clone, Copy)]
struct DeliveryAttempt {
    number: u32,
    next_delay: Duration,
}

impl DeliveryAttempt {
    fn first(policy: &RetryPolicy) -> Self {
        Self {
            number: 1,
            next_delay: policy.delay_before_retry(1),
        }
    }

    fn next(self, policy: &RetryPolicy) -> Self {
        let number = self.number + 1;
        Self {
            number,
            next_delay: policy.delay_before_retry(number),
        }
    }
}

/// Submits outcomes with classification and bounded retries.
#[derive(Clone)]
pub struct DeliveryClient {
    transport: Arc<dyn DeliveryTransport>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for DeliveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DeliveryClient {
    /// Create a client over any transport.
    pub fn new(transport: impl DeliveryTransport + 'static, policy: RetryPolicy) -> Self {
        Self {
            transport: Arc::new(transport),
            policy: RetryPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
        }
    }

    /// Create an HTTP client from the `[delivery]` configuration section.
    ///
    /// # Errors
    ///
    /// See [`HttpTransport::from_config`].
    pub fn from_config(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        Ok(Self::new(
            HttpTransport::from_config(config)?,
            RetryPolicy::from_config(config),
        ))
    }

    /// Retry policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver `outcome`, retrying retryable failures.
    ///
    /// Only one attempt is in flight at a time. Cancelling `cancel` aborts
    /// the in-flight attempt or backoff and yields
    /// [`DeliveryResult::Abandoned`].
    pub async fn submit(&self, outcome: ScanOutcome, cancel: &CancellationToken) -> DeliveryReport {
        let payload = DeliveryPayload::from(&outcome);
        let result = self.run(&payload, cancel).await;

        match &result {
            DeliveryResult::Delivered { attempts, status } => {
                info!(scan_id = %outcome.scan_id, attempts, status, "Outcome delivered");
            }
            DeliveryResult::Rejected { attempts, failure } => {
                warn!(scan_id = %outcome.scan_id, attempts, %failure, "Outcome rejected");
            }
            DeliveryResult::Exhausted { attempts, failure } => {
                warn!(
                    scan_id = %outcome.scan_id,
                    attempts,
                    %failure,
                    "Outcome delivery failed permanently"
                );
            }
            DeliveryResult::Abandoned { attempts } => {
                info!(scan_id = %outcome.scan_id, attempts, "Outcome delivery cancelled");
            }
        }

        DeliveryReport { outcome, result }
    }

    async fn run(&self, payload: &DeliveryPayload, cancel: &CancellationToken) -> DeliveryResult {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = DeliveryAttempt::first(&self.policy);

        loop {
            if cancel.is_cancelled() {
                return DeliveryResult::Abandoned {
                    attempts: attempt.number - 1,
                };
            }

            debug!(attempt = attempt.number, max_attempts, "Posting outcome");
            let reply = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return DeliveryResult::Abandoned { attempts: attempt.number };
                }
                reply = self.transport.post(payload) => reply,
            };

            let failure = match reply.map_err(DeliveryFailure::from) {
                Ok(reply) => match classify_reply(&reply) {
                    Ok(status) => {
                        return DeliveryResult::Delivered {
                            attempts: attempt.number,
                            status,
                        };
                    }
                    Err(failure) => failure,
                },
                Err(failure) => failure,
            };

            if !failure.kind.is_retryable() {
                return DeliveryResult::Rejected {
                    attempts: attempt.number,
                    failure,
                };
            }
            if attempt.number >= max_attempts {
                return DeliveryResult::Exhausted {
                    attempts: attempt.number,
                    failure,
                };
            }

            warn!(
                attempt = attempt.number,
                max_attempts,
                next_delay_ms = u64::try_from(attempt.next_delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "Delivery attempt failed, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return DeliveryResult::Abandoned { attempts: attempt.number };
                }
                () = tokio::time::sleep(attempt.next_delay) => {}
            }
            attempt = attempt.next(&self.policy);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use httpmock::prelude::*;
    use tokio::time::Instant;

    use super::*;
    use crate::types::SessionRequest;

    fn request() -> SessionRequest {
        SessionRequest {
            scan_id: "abc123".into(),
            client_id: "xyz".into(),
            callback_hint: None,
        }
    }

    fn success_outcome() -> ScanOutcome {
        ScanOutcome::succeeded(&request(), "felica:0127005D2A1B3C4D".into())
    }

    fn reply(status: u16) -> Result<HttpReply, TransportFailure> {
        Ok(HttpReply {
            status,
            body: String::new(),
        })
    }

    /// Replays a fixed list of replies and records when each request was made.
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        replies: Arc<Mutex<VecDeque<Result<HttpReply, TransportFailure>>>>,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<HttpReply, TransportFailure>>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into())),
                calls: Arc::default(),
            }
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryTransport for ScriptedTransport {
        async fn post(&self, _payload: &DeliveryPayload) -> Result<HttpReply, TransportFailure> {
            self.calls.lock().unwrap().push(Instant::now());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| reply(500))
        }
    }

    fn client(transport: &ScriptedTransport) -> DeliveryClient {
        DeliveryClient::new(transport.clone(), RetryPolicy::default())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=6).map(|n| policy.delay_before_retry(n)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 8, 8].map(Duration::from_secs).to_vec()
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before_retry(u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(DeliveryPayload::from(&success_outcome())).unwrap();
        assert_eq!(json["scan_id"], "abc123");
        assert_eq!(json["card_id"], "felica:0127005D2A1B3C4D");
        assert_eq!(json["success"], true);
        assert!(json["timestamp"].is_i64());
        assert!(json.get("error_message").is_none());

        let failed = ScanOutcome::failed(&request(), ErrorKind::Timeout);
        let json = serde_json::to_value(DeliveryPayload::from(&failed)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["card_id"], "");
        assert_eq!(json["error_kind"], "timeout");
        assert_eq!(json["error_message"], ErrorKind::Timeout.message());
    }

    #[test]
    fn test_classify_reply() {
        let ok = HttpReply {
            status: 201,
            body: String::new(),
        };
        assert_eq!(classify_reply(&ok), Ok(201));

        let rejected = HttpReply {
            status: 422,
            body: r#"{"error":{"message":"Unknown card","status_code":422}}"#.into(),
        };
        let failure = classify_reply(&rejected).unwrap_err();
        assert_eq!(failure.kind, ErrorKind::ClientError);
        assert_eq!(failure.status, Some(422));
        assert_eq!(failure.message, "Unknown card");

        let unavailable = HttpReply {
            status: 503,
            body: "<html>".into(),
        };
        let failure = classify_reply(&unavailable).unwrap_err();
        assert_eq!(failure.kind, ErrorKind::ServerError);
        assert_eq!(failure.message, "Service Unavailable");

        let redirect = HttpReply {
            status: 302,
            body: String::new(),
        };
        assert_eq!(
            classify_reply(&redirect).unwrap_err().kind,
            ErrorKind::ClientError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_server_errors_with_backoff() {
        let transport = ScriptedTransport::new(vec![reply(503), reply(503), reply(200)]);
        let report = client(&transport)
            .submit(success_outcome(), &CancellationToken::new())
            .await;

        assert_eq!(
            report.result,
            DeliveryResult::Delivered {
                attempts: 3,
                status: 200
            }
        );
        assert_eq!(report.outcome.scan_id, "abc123");

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(1));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_never_retried() {
        let transport = ScriptedTransport::new(vec![reply(404), reply(200)]);
        let report = client(&transport)
            .submit(success_outcome(), &CancellationToken::new())
            .await;

        assert!(matches!(
            report.result,
            DeliveryResult::Rejected { attempts: 1, ref failure } if failure.kind == ErrorKind::ClientError
        ));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_reported() {
        let transport = ScriptedTransport::new(vec![reply(500), reply(502), reply(503)]);
        let report = client(&transport)
            .submit(success_outcome(), &CancellationToken::new())
            .await;

        match report.result {
            DeliveryResult::Exhausted { attempts, failure } => {
                assert_eq!(attempts, 3);
                assert_eq!(failure.status, Some(503));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_classified() {
        let timeout = Err(TransportFailure {
            kind: ErrorKind::RequestTimeout,
            message: "operation timed out".into(),
        });
        let transport = ScriptedTransport::new(vec![timeout, reply(204)]);
        let report = client(&transport)
            .submit(success_outcome(), &CancellationToken::new())
            .await;
        assert_eq!(report.result.attempts(), 2);
        assert!(report.result.is_delivered());

        let invalid = Err(TransportFailure {
            kind: ErrorKind::InvalidRequest,
            message: "builder error".into(),
        });
        let transport = ScriptedTransport::new(vec![invalid, reply(200)]);
        let report = client(&transport)
            .submit(success_outcome(), &CancellationToken::new())
            .await;
        assert_eq!(report.result.error_kind(), Some(ErrorKind::InvalidRequest));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_submit() {
        let transport = ScriptedTransport::new(vec![reply(200)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = client(&transport).submit(success_outcome(), &cancel).await;

        assert_eq!(report.result, DeliveryResult::Abandoned { attempts: 0 });
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retries() {
        let transport = ScriptedTransport::new(vec![reply(503), reply(200)]);
        let cancel = CancellationToken::new();
        let client = client(&transport);

        let submit = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.submit(success_outcome(), &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        let report = submit.await.unwrap();
        assert_eq!(report.result, DeliveryResult::Abandoned { attempts: 1 });
        assert_eq!(report.result.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_http_transport_posts_json() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/scans")
                    .header("content-type", "application/json")
                    .json_body_partial(r#"{"scan_id":"abc123","client_id":"xyz","success":true}"#);
                then.status(201);
            })
            .await;

        let endpoint = Url::parse(&server.url("/api/scans")).unwrap();
        let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();
        let report = DeliveryClient::new(transport, RetryPolicy::default())
            .submit(success_outcome(), &CancellationToken::new())
            .await;

        mock.assert_async().await;
        assert_eq!(
            report.result,
            DeliveryResult::Delivered {
                attempts: 1,
                status: 201
            }
        );
    }

    #[tokio::test]
    async fn test_http_transport_does_not_retry_404() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/scans");
                then.status(404)
                    .json_body(serde_json::json!({"error": {"message": "No such scan", "status_code": 404}}));
            })
            .await;

        let endpoint = Url::parse(&server.url("/api/scans")).unwrap();
        let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();
        let report = DeliveryClient::new(transport, RetryPolicy::default())
            .submit(success_outcome(), &CancellationToken::new())
            .await;

        mock.assert_hits_async(1).await;
        let failure = report.result.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::ClientError);
        assert_eq!(failure.message, "No such scan");
    }

    #[tokio::test]
    async fn test_http_transport_retries_500_until_exhausted() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/scans");
                then.status(500);
            })
            .await;

        let endpoint = Url::parse(&server.url("/api/scans")).unwrap();
        let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        };
        let report = DeliveryClient::new(transport, policy)
            .submit(success_outcome(), &CancellationToken::new())
            .await;

        mock.assert_hits_async(3).await;
        assert!(matches!(
            report.result,
            DeliveryResult::Exhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Url::parse(&format!("http://127.0.0.1:{port}/api/scans")).unwrap();
        let transport = HttpTransport::new(endpoint, Duration::from_secs(5)).unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let report = DeliveryClient::new(transport, policy)
            .submit(success_outcome(), &CancellationToken::new())
            .await;

        assert_eq!(report.result.error_kind(), Some(ErrorKind::TransportError));
        assert_eq!(report.result.attempts(), 2);
    }
}
