//! Result lookup and failed-delivery listing.

use axum::extract::{Path, State};
use axum::Json;
use cardrelay_core::{CardRelayError, DeadLetter};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::board::ScanResult;
use crate::state::SharedState;

/// Outcomes the backend never accepted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FailedDeliveriesResponse {
    /// Records, oldest first.
    pub records: Vec<DeadLetter>,

    /// Number of records.
    #[schema(example = 0)]
    pub total: usize,
}

/// Get the result of one scan.
#[utoipa::path(
    get,
    path = "/api/results/{scan_id}",
    tag = "scans",
    operation_id = "getResult",
    summary = "Get a scan result",
    description = "Returns the status of the scan started with `scan_id`: \
        `pending` while it runs, then `succeeded` with the card id or \
        `failed` with an error kind. Only recent scans are kept.",
    params(
        ("scan_id" = String, Path, description = "Correlation token from the activation URI")
    ),
    responses(
        (status = 200, description = "Scan found", body = ScanResult),
        (status = 404, description = "Unknown or evicted scan", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_result(
    State(state): State<SharedState>,
    Path(scan_id): Path<String>,
) -> ApiResult<Json<ScanResult>> {
    state
        .results()
        .get(&scan_id)
        .map(Json)
        .ok_or_else(|| ApiError::scan_not_found(&scan_id))
}

/// List outcomes whose delivery was exhausted.
#[utoipa::path(
    get,
    path = "/api/deliveries/failed",
    tag = "deliveries",
    operation_id = "listFailedDeliveries",
    summary = "List undelivered outcomes",
    description = "Returns outcomes the backend never accepted after every \
        retry. They are kept on disk for inspection or replay.",
    responses(
        (status = 200, description = "Records", body = FailedDeliveriesResponse),
        (status = 500, description = "Store unreadable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn list_failed_deliveries(
    State(state): State<SharedState>,
) -> ApiResult<Json<FailedDeliveriesResponse>> {
    let Some(store) = state.relay().dead_letters().cloned() else {
        return Ok(Json(FailedDeliveriesResponse {
            records: Vec::new(),
            total: 0,
        }));
    };

    let records = tokio::task::spawn_blocking(move || store.list())
        .await
        .map_err(|e| ApiError::InternalError {
            error_code: "task_failed".to_string(),
            message: "Failed to read the delivery store".to_string(),
            details: Some(e.to_string()),
        })?
        .map_err(CardRelayError::from)?;

    Ok(Json(FailedDeliveriesResponse {
        total: records.len(),
        records,
    }))
}
