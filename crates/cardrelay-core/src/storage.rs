//! Persistent storage for undeliverable outcomes.
//!
//! An outcome whose delivery exhausted every retry is written to
//! `<data_dir>/undelivered/` as one JSON file, so it can be inspected or
//! replayed instead of being lost.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::delivery::DeliveryFailure;
use crate::types::ScanOutcome;

const UNDELIVERED_DIR: &str = "undelivered";

/// Errors reading or writing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No data directory could be determined for this platform.
    #[error("Cannot determine data directory")]
    NoDataDir,

    /// Filesystem access failed.
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A record could not be encoded.
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One outcome the backend never accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeadLetter {
    /// Record id.
    pub id: Uuid,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
    /// The outcome as it was submitted.
    pub outcome: ScanOutcome,
    /// The last delivery failure.
    pub failure: DeliveryFailure,
}

/// File-backed store of [`DeadLetter`]s.
#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    data_dir: PathBuf,
}

impl DeadLetterStore {
    /// Create a store rooted at `data_dir`. Nothing is created until the
    /// first record is written.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Create a store in the default location.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoDataDir`] if no home directory is known.
    pub fn in_default_location() -> StoreResult<Self> {
        default_data_dir().map(Self::new)
    }

    /// Root directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn undelivered_dir(&self) -> PathBuf {
        self.data_dir.join(UNDELIVERED_DIR)
    }

    /// Persist `outcome` with the failure that ended its delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn record(
        &self,
        outcome: &ScanOutcome,
        failure: &DeliveryFailure,
    ) -> StoreResult<DeadLetter> {
        let record = DeadLetter {
            id: Uuid::now_v7(),
            recorded_at: Utc::now(),
            outcome: outcome.clone(),
            failure: failure.clone(),
        };

        let dir = self.undelivered_dir();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!(
            "{}-{}.json",
            record.recorded_at.format("%Y%m%dT%H%M%S%.3fZ"),
            record.id
        ));
        let content = serde_json::to_string_pretty(&record)?;
        std::fs::write(&path, content).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), scan_id = %outcome.scan_id, "Recorded undelivered outcome");
        Ok(record)
    }

    /// All records, oldest first. Unreadable files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn list(&self) -> StoreResult<Vec<DeadLetter>> {
        let dir = self.undelivered_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<DeadLetter>(&content).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(record) => records.push(record),
                Err(error) => warn!(path = %path.display(), %error, "Skipping unreadable record"),
            }
        }

        records.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }
}

/// Default data directory.
///
/// On Linux: `/var/lib/cardrelay/`
/// Elsewhere: the platform data directory (e.g. `~/Library/Application Support/cardrelay`).
///
/// # Errors
///
/// Returns [`StoreError::NoDataDir`] if no home directory is known.
pub fn default_data_dir() -> StoreResult<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/var/lib/cardrelay"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs =
            directories::ProjectDirs::from("", "", "cardrelay").ok_or(StoreError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}
