//! Contactless card reader abstraction.
//!
//! A [`CardReader`] is owned by exactly one scan session at a time. The
//! session asks it to start discovery, then drives connect and identifier
//! reads itself. Asynchronous hardware notifications (cards appearing, the
//! hardware session being torn down) are pushed as [`ReaderEvent`]s into the
//! channel handed to [`CardReader::begin_polling`]; the session serializes
//! them with its own timer and cancellation before acting on any of them.
//!
//! Two backends exist:
//! - [`PcscReader`] (feature `pcsc`) for PC/SC contactless readers
//! - [`MockReader`] (tests, or builds without `pcsc`) with scripted behavior

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{CardTechnology, Target};

#[cfg(any(test, feature = "mock-reader", not(feature = "pcsc")))]
mod mock;
#[cfg(feature = "pcsc")]
mod pcsc;

#[cfg(any(test, feature = "mock-reader", not(feature = "pcsc")))]
pub use mock::{MockReader, MockReaderStats};
#[cfg(feature = "pcsc")]
pub use self::pcsc::PcscReader;

/// Notification pushed by the reader while a session is polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// One discovery event. May carry zero, one or several cards.
    TargetsDiscovered(Vec<Target>),

    /// The hardware session ended on its own.
    Invalidated(InvalidationReason),
}

/// Why the hardware invalidated its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The user dismissed the reader (system sheet, button, ...).
    UserCanceled,
    /// The hardware's own session limit elapsed.
    SessionTimeout,
    /// Anything else reported by the driver.
    Other(String),
}

/// Errors reported by reader operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReaderError {
    /// No reader hardware is present or it is disabled.
    #[error("No card reader available: {message}")]
    Unavailable {
        /// Driver detail.
        message: String,
    },

    /// Connecting to the detected card failed.
    #[error("Failed to connect to card on '{handle}': {message}")]
    ConnectFailed {
        /// Target handle.
        handle: String,
        /// Driver detail.
        message: String,
    },

    /// Communicating with a connected card failed.
    #[error("Card communication failed: {message}")]
    Communication {
        /// Driver detail.
        message: String,
    },
}

/// Result type for reader operations.
pub type ReaderResult<T> = std::result::Result<T, ReaderError>;

/// A contactless card reader driven by a scan session.
///
/// Implementations must not block the async runtime; blocking driver calls
/// belong on `spawn_blocking`.
#[async_trait]
pub trait CardReader: Send + 'static {
    /// Short name of the backend, for logs and health output.
    fn kind(&self) -> &'static str;

    /// Returns `true` if the reader is present and enabled.
    async fn is_available(&mut self) -> bool;

    /// Start target discovery, pushing notifications into `events`.
    ///
    /// Sends after the session has ended fail and must be ignored.
    async fn begin_polling(&mut self, events: mpsc::Sender<ReaderEvent>) -> ReaderResult<()>;

    /// Connect to `target`.
    async fn connect(&mut self, target: &Target) -> ReaderResult<()>;

    /// Read the raw identifier of the connected `target`.
    ///
    /// For FeliCa this is the 8-byte IDm, for ISO 14443 the UID.
    async fn read_identifier(&mut self, target: &Target) -> ReaderResult<Vec<u8>>;

    /// Tear down the hardware session. Called exactly once per session.
    async fn invalidate(&mut self, reason: &str);
}

/// PC/SC registered application provider identifier for storage-card ATRs.
const PCSC_RID: [u8; 5] = [0xa0, 0x00, 0x00, 0x03, 0x06];

/// Derive the card technology from a PC/SC ATR.
///
/// Contactless storage cards are reported with the PC/SC part 3 ATR
/// `3B 8F 80 01 80 4F 0C <RID> <SS> <NN NN> ...` where `SS` names the
/// standard. Anything else is reported as [`CardTechnology::Unknown`].
#[must_use]
pub fn technology_from_atr(atr: &[u8]) -> CardTechnology {
    if atr.len() < 15 || atr[0] != 0x3b || atr[4..7] != [0x80, 0x4f, 0x0c] {
        return CardTechnology::Unknown;
    }
    if atr[7..12] != PCSC_RID {
        return CardTechnology::Unknown;
    }
    match atr[12] {
        0x03 => CardTechnology::Iso14443a,
        0x07 => CardTechnology::Iso14443b,
        0x0b => CardTechnology::Iso15693,
        0x11 | 0x12 => CardTechnology::Felica,
        _ => CardTechnology::Unknown,
    }
}
