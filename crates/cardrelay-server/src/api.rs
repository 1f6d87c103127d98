//! HTTP API routes and handlers.
//!
//! Endpoints are organized by domain:
//! - `activations` - Activation intake
//! - `session` - Running scan inspection and cancellation
//! - `results` - Per-scan results and undelivered outcomes
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod activations;
pub mod error;
pub mod health;
pub mod openapi;
pub mod results;
pub mod session;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                     - Health check
/// /api
/// ├── /activations            - Start a scan from an activation URI
/// ├── /session                - Running scan snapshot
/// │   └── /cancel             - Cancel the running scan
/// ├── /results/{scan_id}      - Result of one scan
/// ├── /deliveries/failed      - Undelivered outcomes
/// ├── /openapi.json           - OpenAPI specification
/// └── /docs                   - Swagger UI
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .merge(
            SwaggerUi::new("/api/docs")
                .url("/api/docs/openapi.json", openapi::ApiDoc::openapi()),
        )
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/activations", post(activations::create_activation))
                .route("/results/{scan_id}", get(results::get_result))
                .route("/deliveries/failed", get(results::list_failed_deliveries))
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/session", session::router()),
        )
        .with_state(state)
}
