//! The `error` module defines the error taxonomy shared by the schema
//! registry, the command dispatcher and the delivery queue.
//!
//! Validation and command outcomes are *not* errors; they are returned as
//! values (`ValidationResult`, `CommandResult`). An `Error` means the
//! operation itself could not be carried out.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing required input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The component is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A fixed-capacity registry or queue is full.
    #[error("{resource} is full (capacity {capacity})")]
    ResourceExhausted {
        resource: &'static str,
        capacity: usize,
    },

    /// A name, id or topic has no match.
    #[error("not found: {0}")]
    NotFound(String),

    /// The component lock was not acquired within its bound.
    #[error("timed out after {waited_ms}ms waiting for {resource} lock")]
    Timeout {
        resource: &'static str,
        waited_ms: u64,
    },

    /// Unexpected internal failure.
    #[error("system error: {0}")]
    SystemError(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
