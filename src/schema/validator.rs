//! Recursive structural validation of a JSON value against a schema body.

use serde_json::Value;

/// Details of a failed structural check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationError {
    /// Human readable description of the failure.
    pub message: String,
    /// JSON-pointer-like path to the offending member, e.g. `/led/brightness`.
    /// Empty when the failure is at the document root.
    pub path: String,
    /// Byte offset into the payload; only set for parse failures.
    pub offset: usize,
}

impl ValidationError {
    fn at_root(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Outcome of `SchemaRegistry::validate`.
///
/// This is a value the caller branches on, not a failure of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    /// The payload is malformed JSON or does not match the schema.
    InvalidArgument(ValidationError),
    /// No enabled schema is registered for the topic.
    NotFound(String),
    /// The registered schema itself is unusable.
    InvalidState(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn message(&self) -> &str {
        match self {
            ValidationResult::Valid => "",
            ValidationResult::InvalidArgument(err) => &err.message,
            ValidationResult::NotFound(msg) | ValidationResult::InvalidState(msg) => msg,
        }
    }

    /// Error path of a structural failure, empty otherwise.
    pub fn path(&self) -> &str {
        match self {
            ValidationResult::InvalidArgument(err) => &err.path,
            _ => "",
        }
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Checks `value` against `schema`, returning the first failure found.
pub(crate) fn validate_value(value: &Value, schema: &Value) -> Result<(), ValidationError> {
    let expected = schema
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::at_root("Schema missing or invalid 'type' field"))?;

    match expected {
        "object" => validate_object(value, schema),
        "string" => validate_string(value, schema),
        "number" => validate_number(value, schema),
        "boolean" => expect_type(value, "boolean", Value::is_boolean),
        "array" => expect_type(value, "array", Value::is_array),
        // unrecognised type keywords constrain nothing
        _ => Ok(()),
    }
}

fn expect_type(
    value: &Value,
    expected: &str,
    check: fn(&Value) -> bool,
) -> Result<(), ValidationError> {
    if check(value) {
        Ok(())
    } else {
        Err(ValidationError::at_root(format!(
            "Expected {}, got {}",
            expected,
            json_type_name(value)
        )))
    }
}

fn validate_object(value: &Value, schema: &Value) -> Result<(), ValidationError> {
    expect_type(value, "object", Value::is_object)?;
    let Some(members) = value.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !members.contains_key(field) {
                return Err(ValidationError {
                    message: format!("Missing required property: {}", field),
                    path: format!("/{}", field),
                    offset: 0,
                });
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, member) in members {
            let Some(sub_schema) = properties.get(name) else {
                continue;
            };
            validate_value(member, sub_schema).map_err(|mut err| {
                err.path = format!("/{}{}", name, err.path);
                err
            })?;
        }
    }

    Ok(())
}

fn validate_string(value: &Value, schema: &Value) -> Result<(), ValidationError> {
    expect_type(value, "string", Value::is_string)?;
    let Some(text) = value.as_str() else {
        return Ok(());
    };

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        let listed = allowed
            .iter()
            .filter_map(Value::as_str)
            .any(|candidate| candidate == text);
        if !listed {
            return Err(ValidationError::at_root(format!(
                "String '{}' is not in allowed enum values",
                text
            )));
        }
    }

    Ok(())
}

fn validate_number(value: &Value, schema: &Value) -> Result<(), ValidationError> {
    expect_type(value, "number", Value::is_number)?;
    let Some(number) = value.as_f64() else {
        return Ok(());
    };

    if let Some(minimum) = schema.get("minimum").and_then(Value::as_f64) {
        if number < minimum {
            return Err(ValidationError::at_root(format!(
                "Number {:.2} is below minimum {:.2}",
                number, minimum
            )));
        }
    }

    if let Some(maximum) = schema.get("maximum").and_then(Value::as_f64) {
        if number > maximum {
            return Err(ValidationError::at_root(format!(
                "Number {:.2} is above maximum {:.2}",
                number, maximum
            )));
        }
    }

    Ok(())
}

/// Converts the 1-based line/column of a parse error into a byte offset.
pub(crate) fn parse_error_offset(payload: &str, err: &serde_json::Error) -> usize {
    let line = err.line();
    if line == 0 {
        return 0;
    }
    let preceding: usize = payload
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum();
    (preceding + err.column().saturating_sub(1)).min(payload.len())
}
