//! The `utils` module provides the pieces shared by the schema registry,
//! the command dispatcher and the delivery queue.
//!
//! - `error`: the crate-wide error taxonomy.
//! - `logging`: tracing subscriber setup.
//! - `clock`: the millisecond time source every component is built with.
//! - `lock`: bounded-wait locking used by every public entry point.

pub mod clock;
pub mod error;
pub mod lock;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
