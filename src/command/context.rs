use std::fmt;

use serde_json::{Map, Value};

/// At most this many parameters are extracted from an envelope.
pub const MAX_COMMAND_PARAMS: usize = 8;
/// Parameter names must be shorter than this many bytes to be extracted.
pub const MAX_PARAM_NAME_LEN: usize = 32;
/// Capacity of the response buffer handed to every handler.
pub const RESPONSE_BUFFER_SIZE: usize = 512;

/// What a command execution amounted to.
///
/// Returned by handlers and by `CommandDispatcher::execute`; none of these
/// are errors of the dispatcher itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandResult {
    Success,
    InvalidParams,
    ExecutionFailed,
    NotFound,
    SchemaInvalid,
    SystemError,
}

impl CommandResult {
    pub fn is_success(self) -> bool {
        self == CommandResult::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandResult::Success => "success",
            CommandResult::InvalidParams => "invalid_params",
            CommandResult::ExecutionFailed => "execution_failed",
            CommandResult::NotFound => "not_found",
            CommandResult::SchemaInvalid => "schema_invalid",
            CommandResult::SystemError => "system_error",
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded UTF-8 text buffer.
///
/// Writes past the capacity are cut at the last whole character that fits
/// and the rest is dropped without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBuffer {
    text: String,
    capacity: usize,
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new(RESPONSE_BUFFER_SIZE)
    }
}

impl ResponseBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            text: String::new(),
            capacity,
        }
    }

    /// Appends as much of `s` as fits. Returns `false` if anything was cut.
    pub fn push_str(&mut self, s: &str) -> bool {
        let room = self.capacity.saturating_sub(self.text.len());
        if s.len() <= room {
            self.text.push_str(s);
            return true;
        }
        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&s[..end]);
        false
    }

    /// Replaces the contents with `s`, truncated to capacity.
    pub fn set(&mut self, s: &str) -> bool {
        self.text.clear();
        self.push_str(s)
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Write for ResponseBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl fmt::Display for ResponseBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// One extracted `(name, value)` pair from the envelope's `parameters`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandParam<'a> {
    pub name: &'a str,
    pub value: &'a Value,
    pub required: bool,
}

/// Everything a handler gets to see for one `execute` call.
///
/// Borrowed from the parsed envelope, so it only lives for the duration of
/// the handler call. Handlers report back through `response`.
#[derive(Debug)]
pub struct CommandContext<'a> {
    pub command_name: &'a str,
    pub topic: &'a str,
    pub payload: &'a str,
    pub root: &'a Value,
    /// The envelope's `parameters` object, when present and an object.
    pub parameters: Option<&'a Map<String, Value>>,
    pub params: Vec<CommandParam<'a>>,
    pub response: ResponseBuffer,
}

impl<'a> CommandContext<'a> {
    /// Builds a context from a parsed envelope, extracting its parameters.
    ///
    /// Fails only when `root` is not a JSON object.
    pub(crate) fn from_envelope(
        command_name: &'a str,
        topic: &'a str,
        payload: &'a str,
        root: &'a Value,
    ) -> Option<Self> {
        let envelope = root.as_object()?;
        let parameters = envelope.get("parameters").and_then(Value::as_object);

        let mut params = Vec::new();
        if let Some(parameters) = parameters {
            for (name, value) in parameters {
                if params.len() >= MAX_COMMAND_PARAMS {
                    tracing::warn!("Maximum parameter count reached ({})", MAX_COMMAND_PARAMS);
                    break;
                }
                if name.len() >= MAX_PARAM_NAME_LEN {
                    tracing::warn!("Skipping parameter with over-long name '{}'", name);
                    continue;
                }
                params.push(CommandParam {
                    name,
                    value,
                    required: false,
                });
            }
        }

        Some(Self {
            command_name,
            topic,
            payload,
            root,
            parameters,
            params,
            response: ResponseBuffer::default(),
        })
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Raw value of the first extracted parameter called `name`.
    pub fn param(&self, name: &str) -> Option<&'a Value> {
        self.params.iter().find(|p| p.name == name).map(|p| p.value)
    }

    pub fn get_string_param<'s>(&'s self, name: &str, default: &'s str) -> &'s str {
        self.param(name).and_then(Value::as_str).unwrap_or(default)
    }

    /// Integer view of a numeric parameter. Fractions are truncated toward
    /// zero and out-of-range values saturate.
    pub fn get_int_param(&self, name: &str, default: i64) -> i64 {
        match self.param(name) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_bool_param(&self, name: &str, default: bool) -> bool {
        self.param(name).and_then(Value::as_bool).unwrap_or(default)
    }
}
