//! OpenAPI specification generation for the cardrelay API.
//!
//! The generated document is consumed by the web client that hands scans
//! off to this service, and documents the payload the backend receives.

use axum::Json;
use cardrelay_core::{
    DeadLetter, DeliveryFailure, DeliveryPayload, ErrorKind, ScanOutcome, SessionPhase,
};
use utoipa::OpenApi;

use super::activations::{ActivationRequest, ActivationResponse};
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::results::FailedDeliveriesResponse;
use super::session::{CancelResponse, SessionSnapshot};
use crate::board::{ResultStatus, ScanResult};

/// Serve the OpenAPI specification as JSON at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty JSON.
/// Used by the gen-openapi binary.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for cardrelay.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "cardrelay API",
        version = "0.1.0",
        description = r#"
# cardrelay API

cardrelay reads contactless cards for web applications that cannot talk to
a card reader themselves.

## Flow

1. The web client opens `cardrelay://scan?scan_id=...&client_id=...`, which is
   forwarded to **createActivation**.
2. The host polls the reader until one card is presented, the deadline
   passes, or the scan is cancelled.
3. The outcome is posted to the configured backend, retrying transient
   failures with exponential backoff (see `DeliveryPayload`).
4. The client reads the result with **getResult**.

Only one scan runs at a time. A second activation is rejected with
`409 session_active`.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local cardrelay host")
    ),
    tags(
        (
            name = "system",
            description = "Health checks"
        ),
        (
            name = "scans",
            description = "Activation intake, running session and per-scan results"
        ),
        (
            name = "deliveries",
            description = "Outcomes the backend never accepted"
        )
    ),
    paths(
        super::health::health_check,
        super::activations::create_activation,
        super::session::get_session,
        super::session::cancel_session,
        super::results::get_result,
        super::results::list_failed_deliveries,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Scan types
            ActivationRequest,
            ActivationResponse,
            SessionSnapshot,
            CancelResponse,
            ScanResult,
            ResultStatus,
            SessionPhase,
            ErrorKind,
            ScanOutcome,
            // Delivery types
            DeliveryPayload,
            DeliveryFailure,
            DeadLetter,
            FailedDeliveriesResponse,
        )
    )
)]
pub struct ApiDoc;
