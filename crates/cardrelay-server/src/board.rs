//! In-memory result board.
//!
//! The server's [`ResultNotifier`]: every activation gets an entry keyed by
//! `scan_id` that the originating client polls via `GET /api/results/{scan_id}`.
//! The board keeps the most recent entries only.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use cardrelay_core::{ErrorKind, ResultNotifier, ScanOutcome, SessionPhase, SessionRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// Entries kept before the oldest is evicted.
pub const DEFAULT_CAPACITY: usize = 256;

/// Where a scan stands from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The session or its delivery is still running.
    Pending,
    /// The card was read and the backend accepted it.
    Succeeded,
    /// The scan failed, was cancelled or could not be delivered.
    Failed,
}

/// One activation as tracked by the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "scan_id": "abc123",
    "client_id": "xyz",
    "callback_hint": "ws",
    "status": "succeeded",
    "phase": { "phase": "succeeded" },
    "card_id": "felica:0127005D2A1B3C4D",
    "error_kind": null,
    "updated_at": "2025-01-15T03:30:00Z"
}))]
pub struct ScanResult {
    /// Correlation token.
    #[schema(example = "abc123")]
    pub scan_id: String,

    /// Originating client.
    #[schema(example = "xyz")]
    pub client_id: String,

    /// How the client asked to be reached, if it said.
    #[schema(nullable)]
    pub callback_hint: Option<String>,

    /// Overall status.
    pub status: ResultStatus,

    /// Last session phase seen.
    pub phase: SessionPhase,

    /// Card identifier once read.
    #[schema(nullable)]
    pub card_id: Option<String>,

    /// Reported failure kind.
    #[schema(nullable)]
    pub error_kind: Option<ErrorKind>,

    /// Last update.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Entries {
    by_scan: HashMap<String, ScanResult>,
    order: VecDeque<String>,
}

/// Bounded map of `scan_id` to [`ScanResult`].
#[derive(Debug)]
pub struct ResultBoard {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl Default for ResultBoard {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ResultBoard {
    /// Create a board holding at most `capacity` entries (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Look up a scan.
    #[must_use]
    pub fn get(&self, scan_id: &str) -> Option<ScanResult> {
        self.with_entries(|entries| entries.by_scan.get(scan_id).cloned())
    }

    /// Number of tracked scans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.by_scan.len())
    }

    /// Returns `true` if nothing has been tracked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut Entries) -> T) -> T {
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    fn update(&self, scan_id: &str, f: impl FnOnce(&mut ScanResult)) {
        self.with_entries(|entries| match entries.by_scan.get_mut(scan_id) {
            Some(result) => {
                f(result);
                result.updated_at = Utc::now();
            }
            None => debug!(scan_id, "Update for untracked scan"),
        });
    }

    fn finish(&self, outcome: &ScanOutcome, status: ResultStatus, kind: Option<ErrorKind>) {
        self.update(&outcome.scan_id, |result| {
            result.status = status;
            result.card_id = (!outcome.card_id.is_empty()).then(|| outcome.card_id.clone());
            result.error_kind = kind;
        });
    }
}

impl ResultNotifier for ResultBoard {
    fn on_started(&self, request: &SessionRequest) {
        let result = ScanResult {
            scan_id: request.scan_id.clone(),
            client_id: request.client_id.clone(),
            callback_hint: request.callback_hint.clone(),
            status: ResultStatus::Pending,
            phase: SessionPhase::Idle,
            card_id: None,
            error_kind: None,
            updated_at: Utc::now(),
        };

        self.with_entries(|entries| {
            if entries.by_scan.insert(request.scan_id.clone(), result).is_some() {
                // Reused scan id; move it to the back of the eviction queue.
                entries.order.retain(|id| id != &request.scan_id);
            }
            entries.order.push_back(request.scan_id.clone());

            while entries.order.len() > self.capacity {
                if let Some(evicted) = entries.order.pop_front() {
                    entries.by_scan.remove(&evicted);
                }
            }
        });
    }

    fn on_state_changed(&self, scan_id: &str, phase: SessionPhase) {
        self.update(scan_id, |result| result.phase = phase);
    }

    fn on_success(&self, outcome: &ScanOutcome) {
        info!(scan_id = %outcome.scan_id, card_id = %outcome.card_id, "Scan delivered");
        self.finish(outcome, ResultStatus::Succeeded, None);
    }

    fn on_failure(&self, outcome: &ScanOutcome, kind: ErrorKind) {
        if kind == ErrorKind::Cancelled {
            info!(scan_id = %outcome.scan_id, "Scan cancelled");
        } else {
            warn!(scan_id = %outcome.scan_id, error_kind = %kind, "Scan failed");
        }
        self.finish(outcome, ResultStatus::Failed, Some(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(scan_id: &str) -> SessionRequest {
        SessionRequest {
            scan_id: scan_id.into(),
            client_id: "xyz".into(),
            callback_hint: Some("ws".into()),
        }
    }

    #[test]
    fn test_started_scan_is_pending() {
        let board = ResultBoard::default();
        board.on_started(&request("abc123"));

        let result = board.get("abc123").unwrap();
        assert_eq!(result.status, ResultStatus::Pending);
        assert_eq!(result.callback_hint.as_deref(), Some("ws"));
        assert!(board.get("other").is_none());
    }

    #[test]
    fn test_success_records_card_id() {
        let board = ResultBoard::default();
        board.on_started(&request("abc123"));
        board.on_state_changed("abc123", SessionPhase::Succeeded);
        board.on_success(&ScanOutcome::succeeded(
            &request("abc123"),
            "felica:0127005D2A1B3C4D".into(),
        ));

        let result = board.get("abc123").unwrap();
        assert_eq!(result.status, ResultStatus::Succeeded);
        assert_eq!(result.phase, SessionPhase::Succeeded);
        assert_eq!(result.card_id.as_deref(), Some("felica:0127005D2A1B3C4D"));
        assert_eq!(result.error_kind, None);
    }

    #[test]
    fn test_failure_records_kind() {
        let board = ResultBoard::default();
        board.on_started(&request("abc123"));
        let outcome = ScanOutcome::failed(&request("abc123"), ErrorKind::Timeout);
        board.on_failure(&outcome, ErrorKind::Timeout);

        let result = board.get("abc123").unwrap();
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.card_id, None);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let board = ResultBoard::new(2);
        board.on_started(&request("a"));
        board.on_started(&request("b"));
        board.on_started(&request("a"));
        board.on_started(&request("c"));

        assert_eq!(board.len(), 2);
        assert!(board.get("b").is_none());
        assert!(board.get("a").is_some());
        assert!(board.get("c").is_some());
    }

    #[test]
    fn test_updates_for_unknown_scans_are_ignored() {
        let board = ResultBoard::default();
        board.on_state_changed("missing", SessionPhase::Polling);
        assert!(board.is_empty());
    }
}
