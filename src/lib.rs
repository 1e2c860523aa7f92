//! # telecmd
//!
//! `telecmd` is the reliable command-and-delivery core of a networked device.
//! Commands arrive as JSON envelopes on pub/sub topics, are checked against
//! per-topic schemas, run by registered handlers, and any replies go out
//! through a retrying, priority-ordered delivery queue.
//!
//! ## Core Modules
//!
//! - `schema`: Named schemas keyed by topic, and the recursive payload validator.
//! - `command`: Command registry and dispatcher, handler contexts and parameter accessors.
//! - `delivery`: Outbound message queue with TTL, retry/backoff and a background worker.
//! - `config`: Loading settings from `config/default.*` and `TELECMD_*` environment variables.
//! - `utils`: Shared error type, logging setup, clocks and timed locking.
//!
//! The three components are plain structs shared behind `Arc`; every public
//! method is safe to call from any thread and gives up with
//! `Error::Timeout` rather than waiting forever on a busy lock.

pub mod command;
pub mod config;
pub mod delivery;
pub mod schema;
pub mod utils;

pub use utils::{Error, Result};
