//! Scan session lifecycle.
//!
//! A session drives one bounded hardware read from `start` to exactly one
//! terminal state:
//!
//! ```text
//! Idle -> Polling -> Connecting -> Extracting -> Succeeded
//!            \            \             \
//!             +------------+-------------+--> Failed(kind) | Cancelled
//! ```
//!
//! - [`machine`] is the pure transition function.
//! - [`controller`] runs it against a [`CardReader`](crate::reader::CardReader)
//!   with a deadline and cancellation.

pub mod controller;
pub mod machine;

pub use controller::{
    ScanSessionController, SessionError, SessionHandle, SessionResult, SessionSettings,
};
pub use machine::{
    transition, Effect, SessionEvent, SessionMachine, SessionPolicy, SessionState, Terminal,
};
