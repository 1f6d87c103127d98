//! Activation intake.
//!
//! The originating web client (or the OS URL handler acting for it) posts the
//! activation URI here. The scan runs in the background; its result is read
//! from `/api/results/{scan_id}`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use cardrelay_core::{CardRelayError, SessionPhase};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body carrying an activation URI.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "uri": "cardrelay://scan?scan_id=abc123&client_id=xyz&callback=ws"
}))]
pub struct ActivationRequest {
    /// The activation URI as received from the browser.
    #[schema(example = "cardrelay://scan?scan_id=abc123&client_id=xyz&callback=ws")]
    pub uri: String,
}

/// An accepted activation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "scan_id": "abc123",
    "session_id": "01926f3e-8d4b-7c9a-b1e2-3f4a5b6c7d8e",
    "phase": { "phase": "polling" }
}))]
pub struct ActivationResponse {
    /// Correlation token from the URI.
    #[schema(example = "abc123")]
    pub scan_id: String,

    /// Server-assigned session id.
    pub session_id: Uuid,

    /// Session phase at the time of the response.
    pub phase: SessionPhase,
}

// ============================================================================
// Handlers
// ============================================================================

/// Accept an activation URI and start a scan.
#[utoipa::path(
    post,
    path = "/api/activations",
    tag = "scans",
    operation_id = "createActivation",
    summary = "Start a scan from an activation URI",
    description = "Validates the activation URI and starts a scan session on \
        the local card reader. Returns immediately; poll \
        `/api/results/{scan_id}` for the outcome. Only one scan runs at a \
        time.",
    request_body = ActivationRequest,
    responses(
        (status = 202, description = "Scan started", body = ActivationResponse),
        (status = 400, description = "Activation URI rejected", body = crate::api::error::ErrorResponse),
        (status = 409, description = "Another scan is running", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn create_activation(
    State(state): State<SharedState>,
    Json(request): Json<ActivationRequest>,
) -> ApiResult<(StatusCode, Json<ActivationResponse>)> {
    let scan = match state.activate(&request.uri).await {
        Ok(scan) => scan,
        Err(CardRelayError::SessionActive) => {
            let err = CardRelayError::SessionActive;
            return Err(ApiError::Conflict {
                error_code: err.error_code().to_ascii_lowercase(),
                message: err.to_string(),
                active_scan_id: state.current().await.map(|current| current.scan_id),
            });
        }
        Err(e) => return Err(e.into()),
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(ActivationResponse {
            scan_id: scan.scan_id.clone(),
            session_id: scan.session_id,
            phase: scan.phase(),
        }),
    ))
}
