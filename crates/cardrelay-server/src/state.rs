//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use cardrelay_core::{
    ActivationParser, CardRelayError, Config, DeadLetterStore, DeliveryClient,
    ResultNotifier, ScanRelay, ScanSessionController, SessionPhase, SessionSettings,
};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::board::ResultBoard;

/// Reader used by the server.
#[cfg(feature = "pcsc")]
pub type ServerReader = cardrelay_core::PcscReader;

/// Reader used by the server.
#[cfg(not(feature = "pcsc"))]
pub type ServerReader = cardrelay_core::MockReader;

/// Shared state handle passed to every handler.
pub type SharedState = Arc<AppState>;

/// Build the reader for this build.
#[cfg(feature = "pcsc")]
#[must_use]
pub fn default_reader(config: &Config) -> ServerReader {
    cardrelay_core::PcscReader::new(Duration::from_millis(config.session.poll_interval_ms))
}

/// Build the reader for this build. Without PC/SC a demo card appears after
/// one second.
#[cfg(not(feature = "pcsc"))]
#[must_use]
pub fn default_reader(_config: &Config) -> ServerReader {
    cardrelay_core::MockReader::demo(Duration::from_secs(1))
}

/// An activation the server is still working on.
#[derive(Debug, Clone)]
pub struct CurrentScan {
    /// Session id.
    pub session_id: Uuid,
    /// Correlation token.
    pub scan_id: String,
    /// Originating client.
    pub client_id: String,
    /// When the activation was accepted.
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    phases: watch::Receiver<SessionPhase>,
}

impl CurrentScan {
    /// Latest session phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.phases.borrow()
    }
}

/// Shared application state.
pub struct AppState {
    config: Config,
    relay: ScanRelay<ServerReader>,
    results: Arc<ResultBoard>,
    /// Activations still scanning or delivering, oldest first.
    in_flight: RwLock<Vec<CurrentScan>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("relay", &self.relay)
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create application state from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery endpoint is unusable or no data
    /// directory can be determined.
    pub fn new(config: Config, reader: ServerReader) -> anyhow::Result<Self> {
        let dead_letters = match &config.storage.data_dir {
            Some(dir) => DeadLetterStore::new(dir.clone()),
            None => DeadLetterStore::in_default_location()?,
        };
        let results = Arc::new(ResultBoard::default());
        let notifier: Arc<dyn ResultNotifier> = Arc::clone(&results) as Arc<dyn ResultNotifier>;

        let relay = ScanRelay::new(
            ActivationParser::from_config(&config.activation),
            ScanSessionController::new(reader, SessionSettings::from_config(&config.session)),
            DeliveryClient::from_config(&config.delivery)?,
            notifier,
        )
        .with_dead_letters(dead_letters);

        Ok(Self {
            config,
            relay,
            results,
            in_flight: RwLock::new(Vec::new()),
        })
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The scan pipeline.
    #[must_use]
    pub const fn relay(&self) -> &ScanRelay<ServerReader> {
        &self.relay
    }

    /// Results recorded for clients.
    #[must_use]
    pub fn results(&self) -> &ResultBoard {
        &self.results
    }

    /// The most recent activation in progress, if any.
    pub async fn current(&self) -> Option<CurrentScan> {
        self.in_flight.read().await.last().cloned()
    }

    /// Accept an activation URI and start its scan.
    ///
    /// # Errors
    ///
    /// Activation and session errors from [`ScanRelay::activate`].
    pub async fn activate(self: &Arc<Self>, uri: &str) -> Result<CurrentScan, CardRelayError> {
        let mut in_flight = self.in_flight.write().await;
        let scan = self.relay.activate(uri)?;

        let entry = CurrentScan {
            session_id: scan.session_id(),
            scan_id: scan.scan_id().to_string(),
            client_id: scan.request().client_id.clone(),
            started_at: Utc::now(),
            cancel: scan.cancel_token(),
            phases: scan.subscribe(),
        };
        in_flight.push(entry.clone());
        drop(in_flight);

        let state = Arc::clone(self);
        let session_id = entry.session_id;
        tokio::spawn(async move {
            match scan.finished().await {
                Ok(report) => info!(
                    %session_id,
                    scan_id = %report.outcome.scan_id,
                    success = report.outcome.success,
                    error_kind = ?report.reported_kind,
                    "Activation finished"
                ),
                Err(e) => warn!(%session_id, error = %e, "Activation lost its completion task"),
            }
            state.finish(session_id).await;
        });

        Ok(entry)
    }

    /// Cancel every activation in progress, including earlier ones still
    /// retrying delivery. Returns the most recent, or `None` if the server is
    /// idle.
    pub async fn cancel_current(&self) -> Option<CurrentScan> {
        let in_flight = self.in_flight.read().await;
        for scan in in_flight.iter() {
            info!(session_id = %scan.session_id, scan_id = %scan.scan_id, "Cancelling scan");
            scan.cancel.cancel();
        }
        in_flight.last().cloned()
    }

    async fn finish(&self, session_id: Uuid) {
        self.in_flight
            .write()
            .await
            .retain(|scan| scan.session_id != session_id);
    }
}
