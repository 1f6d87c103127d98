//! # cardrelay-server
//!
//! Local host service for cardrelay.
//!
//! This binary provides:
//! - REST API for activations, the running session and scan results
//! - OpenAPI document at `/api/openapi.json`
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, with a simulated reader
//! cargo run --package cardrelay-server
//!
//! # With a PC/SC contactless reader
//! cargo run --package cardrelay-server --features pcsc
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use cardrelay_core::Config;
use cardrelay_server::state::{default_reader, AppState, SharedState};
use cardrelay_server::{api, logging};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting cardrelay-server");

    let config = Config::load().context("Failed to load configuration")?;
    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .context("Invalid server.bind_address")?;

    let reader = default_reader(&config);
    let state: SharedState = Arc::new(AppState::new(config, reader)?);
    info!(
        reader = state.relay().controller().reader_kind(),
        endpoint = %state.config().delivery.endpoint,
        "Scan relay ready"
    );

    let app = api::create_router(Arc::clone(&state)).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!("cardrelay-server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM, after cancelling the running scan.
async fn shutdown_signal(state: SharedState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
                }
            }
            _ => {
                warn!("Could not install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    if let Some(scan) = state.cancel_current().await {
        info!(scan_id = %scan.scan_id, "Cancelled running scan for shutdown");
    }
}
