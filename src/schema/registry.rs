use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tracing::{error, info, warn};

use super::validator::{
    ValidationError, ValidationResult, json_type_name, parse_error_offset, validate_value,
};
use crate::utils::lock::lock_within;
use crate::utils::{Clock, Error, Result, SystemClock};

/// Maximum number of schemas the registry holds.
pub const MAX_SCHEMAS: usize = 32;
/// Schema names must be shorter than this many bytes.
pub const MAX_SCHEMA_NAME_LEN: usize = 64;
/// Topic patterns must be shorter than this many bytes.
pub const MAX_TOPIC_PATTERN_LEN: usize = 128;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// A named schema bound to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub name: String,
    /// Compared with the inbound topic by exact string match.
    pub topic_pattern: String,
    pub body: Value,
    /// Content revision; 1 on first registration, bumped on each replacement.
    pub revision: u64,
    pub enabled: bool,
}

impl Schema {
    pub fn new(name: impl Into<String>, topic_pattern: impl Into<String>, body: Value) -> Self {
        Self {
            name: name.into(),
            topic_pattern: topic_pattern.into(),
            body,
            revision: 0,
            enabled: true,
        }
    }

    /// Builds a schema from a JSON text body.
    pub fn from_json(
        name: impl Into<String>,
        topic_pattern: impl Into<String>,
        body: &str,
    ) -> Result<Self> {
        let body: Value = serde_json::from_str(body)
            .map_err(|e| Error::invalid_argument(format!("schema body is not JSON: {e}")))?;
        Ok(Self::new(name, topic_pattern, body))
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    pub total_validations: u64,
    pub successful_validations: u64,
    pub failed_validations: u64,
    pub schema_count: usize,
    pub last_validation_time_ms: u64,
}

#[derive(Debug, Default)]
struct Inner {
    schemas: Vec<Schema>,
    stats: ValidatorStats,
}

/// Fixed-capacity table of schemas plus validation statistics.
///
/// Every method takes the registry lock with a bounded wait and copies data
/// in or out; callers never hold references into the table.
pub struct SchemaRegistry {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        lock_within(&self.inner, self.lock_timeout, "schema registry")
    }

    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> impl Sized + '_ {
        self.inner.lock()
    }

    /// Inserts `schema`, or replaces the schema with the same name in place.
    pub fn register(&self, mut schema: Schema) -> Result<()> {
        if schema.name.is_empty() || schema.topic_pattern.is_empty() || schema.body.is_null() {
            error!("Invalid schema: missing required fields");
            return Err(Error::invalid_argument(
                "schema name, topic pattern and body are required",
            ));
        }
        if schema.name.len() >= MAX_SCHEMA_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "schema name longer than {} bytes",
                MAX_SCHEMA_NAME_LEN - 1
            )));
        }
        if schema.topic_pattern.len() >= MAX_TOPIC_PATTERN_LEN {
            return Err(Error::invalid_argument(format!(
                "topic pattern longer than {} bytes",
                MAX_TOPIC_PATTERN_LEN - 1
            )));
        }

        let mut inner = self.lock()?;

        if let Some(existing) = inner.schemas.iter_mut().find(|s| s.name == schema.name) {
            warn!("Schema '{}' already exists, replacing", schema.name);
            schema.revision = existing.revision + 1;
            *existing = schema;
            return Ok(());
        }

        if inner.schemas.len() >= MAX_SCHEMAS {
            error!("Schema registry full (max {} schemas)", MAX_SCHEMAS);
            return Err(Error::ResourceExhausted {
                resource: "schema registry",
                capacity: MAX_SCHEMAS,
            });
        }

        info!(
            "Schema '{}' registered (pattern: '{}')",
            schema.name, schema.topic_pattern
        );
        schema.revision = 1;
        inner.schemas.push(schema);
        inner.stats.schema_count = inner.schemas.len();
        Ok(())
    }

    /// Returns the first enabled schema whose topic pattern equals `topic`.
    pub fn find(&self, topic: &str) -> Result<Schema> {
        let inner = self.lock()?;
        Self::lookup(&inner, topic)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no schema for topic '{topic}'")))
    }

    fn lookup<'a>(inner: &'a Inner, topic: &str) -> Option<&'a Schema> {
        inner
            .schemas
            .iter()
            .find(|s| s.enabled && s.topic_pattern == topic)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let index = inner
            .schemas
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::not_found(format!("schema '{name}'")))?;
        inner.schemas.remove(index);
        inner.stats.schema_count = inner.schemas.len();
        info!("Schema '{}' removed", name);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.schemas.clear();
        inner.stats.schema_count = 0;
        info!("All schemas cleared");
        Ok(())
    }

    /// Copies of all registered schemas, in registration order.
    pub fn list(&self) -> Result<Vec<Schema>> {
        Ok(self.lock()?.schemas.clone())
    }

    pub fn schema_count(&self) -> Result<usize> {
        Ok(self.lock()?.schemas.len())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut inner = self.lock()?;
        let schema = inner
            .schemas
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::not_found(format!("schema '{name}'")))?;
        schema.enabled = enabled;
        Ok(())
    }

    pub fn stats(&self) -> Result<ValidatorStats> {
        Ok(self.lock()?.stats.clone())
    }

    /// Zeroes the validation counters; `schema_count` keeps tracking the table.
    pub fn reset_stats(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.stats = ValidatorStats {
            schema_count: inner.schemas.len(),
            ..Default::default()
        };
        info!("Schema validator statistics reset");
        Ok(())
    }

    /// Validates `payload` against the schema registered for `topic`.
    ///
    /// The returned `ValidationResult` is the outcome; `Err` only means the
    /// registry lock could not be taken to look the schema up.
    pub fn validate(&self, topic: &str, payload: &str) -> Result<ValidationResult> {
        let schema = {
            let inner = self.lock()?;
            Self::lookup(&inner, topic).cloned()
        };

        let outcome = match schema {
            None => ValidationResult::NotFound(format!("No schema found for topic: {topic}")),
            Some(schema) => Self::check_payload(topic, payload, &schema.body),
        };

        self.record_validation(topic, &outcome);
        Ok(outcome)
    }

    /// Counts a finished validation. The outcome is already decided, so a
    /// lock timeout only costs the statistics update.
    pub(super) fn record_validation(&self, topic: &str, outcome: &ValidationResult) {
        if outcome.is_valid() {
            info!("JSON validation passed for topic: {}", topic);
        } else {
            warn!(
                "JSON validation failed for topic: {} - {}",
                topic,
                outcome.message()
            );
        }

        let mut inner = match self.lock() {
            Ok(inner) => inner,
            Err(e) => {
                warn!("Validation statistics not updated: {}", e);
                return;
            }
        };
        inner.stats.total_validations += 1;
        inner.stats.last_validation_time_ms = self.clock.now_ms();
        if outcome.is_valid() {
            inner.stats.successful_validations += 1;
        } else {
            inner.stats.failed_validations += 1;
        }
    }

    fn check_payload(topic: &str, payload: &str, body: &Value) -> ValidationResult {
        let document: Value = match serde_json::from_str(payload) {
            Ok(document) => document,
            Err(e) => {
                return ValidationResult::InvalidArgument(ValidationError {
                    message: format!("Invalid JSON payload: {e}"),
                    path: String::new(),
                    offset: parse_error_offset(payload, &e),
                });
            }
        };

        if !body.is_object() {
            return ValidationResult::InvalidState(format!(
                "Invalid schema for topic {}: expected object, got {}",
                topic,
                json_type_name(body)
            ));
        }

        match validate_value(&document, body) {
            Ok(()) => ValidationResult::Valid,
            Err(err) => ValidationResult::InvalidArgument(err),
        }
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
