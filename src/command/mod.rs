//! The `command` module maps command envelopes onto registered handlers.
//!
//! An envelope is a JSON object `{"command": "<name>", "parameters": {...}}`.
//! The dispatcher looks the name up, optionally validates the payload against
//! the topic's schema, extracts up to eight parameters and runs the handler.
//! Outcomes are reported as `CommandResult` values and tallied in
//! `CommandStats`.

pub mod context;
pub mod dispatcher;

pub use context::{
    CommandContext, CommandParam, CommandResult, MAX_COMMAND_PARAMS, RESPONSE_BUFFER_SIZE,
    ResponseBuffer,
};
pub use dispatcher::{
    CommandDefinition, CommandDispatcher, CommandHandler, CommandStats, MAX_COMMAND_NAME_LEN,
    MAX_COMMANDS,
};
