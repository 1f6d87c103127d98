//! # cardrelay-core
//!
//! Core logic for cardrelay, which reads contactless cards on behalf of a
//! web client that cannot reach the reader itself.
//!
//! A browser opens an activation URI such as
//! `cardrelay://scan?scan_id=abc123&client_id=xyz`. cardrelay parses it,
//! runs one bounded scan session against the local reader, posts the outcome
//! to a backend, and tells the client how it went.
//!
//! ## Architecture
//!
//! - [`activation`] - Activation URI parsing and validation
//! - [`session`] - The scan session state machine and its controller
//! - [`reader`] - Card reader abstraction (PC/SC hardware or a mock)
//! - [`card_id`] - Canonical card identifier formatting
//! - [`delivery`] - Backend submission with bounded retry and backoff
//! - [`notifier`] - Progress and result callbacks to the client
//! - [`relay`] - The end-to-end pipeline tying the above together
//! - [`config`] - Configuration loading, saving, and validation
//! - [`storage`] - Persistent store for undeliverable outcomes
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod activation;
pub mod card_id;
pub mod config;
pub mod delivery;
pub mod error;
pub mod notifier;
pub mod reader;
pub mod relay;
pub mod session;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use activation::{ActivationError, ActivationParser, ActivationResult, InvalidReason};
pub use card_id::format_card_id;
pub use config::{
    ActivationConfig, Config, ConfigError, ConfigResult, DeliveryConfig, ServerConfig,
    SessionConfig, StorageConfig, TechnologyFilter,
};
pub use delivery::{
    DeliveryClient, DeliveryError, DeliveryFailure, DeliveryPayload, DeliveryReport,
    DeliveryResult, DeliveryTransport, HttpTransport, RetryPolicy,
};
pub use error::{CardRelayError, Result};
pub use notifier::{ChannelNotifier, Notification, ResultNotifier, TracingNotifier};
#[cfg(any(test, feature = "mock-reader", not(feature = "pcsc")))]
pub use reader::MockReader;
#[cfg(feature = "pcsc")]
pub use reader::PcscReader;
pub use reader::{CardReader, InvalidationReason, ReaderError, ReaderEvent};
pub use relay::{ActiveScan, RelayReport, ScanRelay};
pub use session::{
    ScanSessionController, SessionError, SessionHandle, SessionPolicy, SessionSettings,
};
pub use storage::{default_data_dir, DeadLetter, DeadLetterStore, StoreError};
pub use types::{CardTechnology, ErrorKind, ScanOutcome, SessionPhase, SessionRequest, Target};
