//! # cardrelay-server
//!
//! Local HTTP host for cardrelay. It accepts activation URIs from the web
//! client, owns the card reader, delivers outcomes to the backend and keeps
//! per-scan results for the client to read back.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod board;
pub mod logging;
pub mod state;
