//! Current session inspection and cancellation.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use cardrelay_core::SessionPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::state::{CurrentScan, SharedState};

/// Creates the session router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(get_session))
        .route("/cancel", post(cancel_session))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Snapshot of the server's scan activity.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "active": true,
    "scan_id": "abc123",
    "client_id": "xyz",
    "session_id": "01926f3e-8d4b-7c9a-b1e2-3f4a5b6c7d8e",
    "phase": { "phase": "polling" },
    "started_at": "2025-01-15T03:30:00Z"
}))]
pub struct SessionSnapshot {
    /// Whether an activation is in progress (scanning or delivering).
    pub active: bool,

    /// Correlation token of the running scan.
    #[schema(nullable)]
    pub scan_id: Option<String>,

    /// Originating client of the running scan.
    #[schema(nullable)]
    pub client_id: Option<String>,

    /// Session id of the running scan.
    #[schema(nullable)]
    pub session_id: Option<Uuid>,

    /// Latest phase; `idle` when nothing runs.
    pub phase: SessionPhase,

    /// When the running scan was accepted.
    #[schema(nullable)]
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    fn idle() -> Self {
        Self {
            active: false,
            scan_id: None,
            client_id: None,
            session_id: None,
            phase: SessionPhase::Idle,
            started_at: None,
        }
    }
}

impl From<CurrentScan> for SessionSnapshot {
    fn from(scan: CurrentScan) -> Self {
        Self {
            active: true,
            phase: scan.phase(),
            scan_id: Some(scan.scan_id),
            client_id: Some(scan.client_id),
            session_id: Some(scan.session_id),
            started_at: Some(scan.started_at),
        }
    }
}

/// Response after requesting cancellation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "cancelled": true,
    "scan_id": "abc123"
}))]
pub struct CancelResponse {
    /// Always `true`; cancellation completes asynchronously.
    pub cancelled: bool,

    /// The scan that was cancelled.
    #[schema(example = "abc123")]
    pub scan_id: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the current session.
#[utoipa::path(
    get,
    path = "/api/session",
    tag = "scans",
    operation_id = "getSession",
    summary = "Get the running scan",
    description = "Returns the scan in progress with its latest phase, or an \
        idle snapshot when the reader is free.",
    responses(
        (status = 200, description = "Snapshot", body = SessionSnapshot)
    )
)]
pub async fn get_session(State(state): State<SharedState>) -> Json<SessionSnapshot> {
    Json(
        state
            .current()
            .await
            .map_or_else(SessionSnapshot::idle, SessionSnapshot::from),
    )
}

/// Cancel the current session.
#[utoipa::path(
    post,
    path = "/api/session/cancel",
    tag = "scans",
    operation_id = "cancelSession",
    summary = "Cancel the running scan",
    description = "Cancels the running scan and any earlier activation whose \
        delivery is still being retried. A delivery that is abandoned this way \
        is reported as `cancelled`, like a cancelled scan. Returns the most \
        recent activation.",
    responses(
        (status = 200, description = "Cancellation requested", body = CancelResponse),
        (status = 404, description = "No scan is running", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn cancel_session(State(state): State<SharedState>) -> ApiResult<Json<CancelResponse>> {
    let scan = state
        .cancel_current()
        .await
        .ok_or_else(ApiError::no_active_session)?;

    Ok(Json(CancelResponse {
        cancelled: true,
        scan_id: scan.scan_id,
    }))
}
