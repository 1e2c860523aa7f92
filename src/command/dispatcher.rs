use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tracing::{error, info, warn};

use super::context::{CommandContext, CommandResult, ResponseBuffer};
use crate::schema::SchemaRegistry;
use crate::utils::lock::lock_within;
use crate::utils::{Clock, Error, Result, SystemClock};

/// Maximum number of commands the dispatcher holds.
pub const MAX_COMMANDS: usize = 16;
/// Command names must be shorter than this many bytes.
pub const MAX_COMMAND_NAME_LEN: usize = 32;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Business logic bound to a command name.
///
/// Any `Fn(&mut CommandContext) -> CommandResult` closure that is
/// `Send + Sync` is a handler.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, ctx: &mut CommandContext<'_>) -> CommandResult;
}

impl<F> CommandHandler for F
where
    F: Fn(&mut CommandContext<'_>) -> CommandResult + Send + Sync,
{
    fn handle(&self, ctx: &mut CommandContext<'_>) -> CommandResult {
        self(ctx)
    }
}

/// A registered command and its execution counters.
#[derive(Clone)]
pub struct CommandDefinition {
    pub name: String,
    pub handler: Arc<dyn CommandHandler>,
    pub description: String,
    /// Empty means the payload is not validated before the handler runs.
    pub schema_name: String,
    pub enabled: bool,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_execution_time_ms: u64,
}

impl CommandDefinition {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut CommandContext<'_>) -> CommandResult + Send + Sync + 'static,
    {
        Self::with_handler(name, Arc::new(handler))
    }

    pub fn with_handler(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            description: String::new(),
            schema_name: String::new(),
            enabled: true,
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_execution_time_ms: 0,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Validate payloads against the topic's schema before running.
    pub fn schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn reset_counters(&mut self) {
        self.execution_count = 0;
        self.success_count = 0;
        self.failure_count = 0;
        self.last_execution_time_ms = 0;
    }
}

impl fmt::Debug for CommandDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("schema_name", &self.schema_name)
            .field("enabled", &self.enabled)
            .field("execution_count", &self.execution_count)
            .field("success_count", &self.success_count)
            .field("failure_count", &self.failure_count)
            .field("last_execution_time_ms", &self.last_execution_time_ms)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandStats {
    pub total_commands_processed: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub schema_validation_failures: u64,
    pub command_not_found_count: u64,
    pub registered_command_count: usize,
    pub last_command_time_ms: u64,
}

#[derive(Debug, Default)]
struct Inner {
    commands: Vec<CommandDefinition>,
    stats: CommandStats,
}

impl Inner {
    fn find_enabled(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.iter().find(|c| c.enabled && c.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut CommandDefinition> {
        self.commands.iter_mut().find(|c| c.name == name)
    }
}

/// Routes command envelopes to registered handlers.
///
/// The dispatcher never holds its own lock while calling the schema registry
/// or a handler.
pub struct CommandDispatcher {
    inner: Mutex<Inner>,
    validator: Arc<SchemaRegistry>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(validator: Arc<SchemaRegistry>) -> Self {
        Self::with_clock(validator, Arc::new(SystemClock))
    }

    pub fn with_clock(validator: Arc<SchemaRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            validator,
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn validator(&self) -> &Arc<SchemaRegistry> {
        &self.validator
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        lock_within(&self.inner, self.lock_timeout, "command dispatcher")
    }

    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> impl Sized + '_ {
        self.inner.lock()
    }

    /// Adds `command`, or replaces the one with the same name and zeroes its
    /// counters.
    pub fn register(&self, mut command: CommandDefinition) -> Result<()> {
        if command.name.is_empty() {
            error!("Invalid command: missing name");
            return Err(Error::invalid_argument("command name is required"));
        }
        if command.name.len() >= MAX_COMMAND_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "command name longer than {} bytes",
                MAX_COMMAND_NAME_LEN - 1
            )));
        }
        command.reset_counters();

        let mut inner = self.lock()?;

        if let Some(existing) = inner.find_mut(&command.name) {
            warn!("Command '{}' already exists, replacing", command.name);
            *existing = command;
            return Ok(());
        }

        if inner.commands.len() >= MAX_COMMANDS {
            error!("Command registry full (max {} commands)", MAX_COMMANDS);
            return Err(Error::ResourceExhausted {
                resource: "command registry",
                capacity: MAX_COMMANDS,
            });
        }

        info!("Command '{}' registered", command.name);
        if !command.description.is_empty() {
            info!("  Description: {}", command.description);
        }
        if !command.schema_name.is_empty() {
            info!("  Schema: {}", command.schema_name);
        }
        inner.commands.push(command);
        inner.stats.registered_command_count = inner.commands.len();
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let index = inner
            .commands
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::not_found(format!("command '{name}'")))?;
        inner.commands.remove(index);
        inner.stats.registered_command_count = inner.commands.len();
        info!("Command '{}' removed", name);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.commands.clear();
        inner.stats.registered_command_count = 0;
        info!("All commands cleared");
        Ok(())
    }

    /// Snapshots of the registered commands, in registration order.
    pub fn list(&self) -> Result<Vec<CommandDefinition>> {
        Ok(self.lock()?.commands.clone())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut inner = self.lock()?;
        let command = inner
            .find_mut(name)
            .ok_or_else(|| Error::not_found(format!("command '{name}'")))?;
        command.enabled = enabled;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<CommandStats> {
        Ok(self.lock()?.stats.clone())
    }

    /// Zeroes global and per-command counters. The registered count stays.
    pub fn reset_stats(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.stats = CommandStats {
            registered_command_count: inner.commands.len(),
            ..Default::default()
        };
        for command in &mut inner.commands {
            command.reset_counters();
        }
        info!("Command dispatcher statistics reset");
        Ok(())
    }

    /// Parses a command envelope and runs the matching handler.
    ///
    /// Whatever the handler wrote into its response buffer is copied into
    /// `response`, truncated to that buffer's capacity. `Err` is returned only
    /// when the dispatcher lock could not be taken before the handler ran.
    pub fn execute(
        &self,
        topic: &str,
        payload: &str,
        response: &mut ResponseBuffer,
    ) -> Result<CommandResult> {
        {
            let mut inner = self.lock()?;
            inner.stats.total_commands_processed += 1;
            inner.stats.last_command_time_ms = self.clock.now_ms();
        }

        let root: Value = match serde_json::from_str(payload) {
            Ok(root) => root,
            Err(e) => {
                error!("Invalid JSON payload ({}): {}", e, payload);
                self.lock()?.stats.failed_commands += 1;
                return Ok(CommandResult::InvalidParams);
            }
        };

        let Some(command_name) = root.get("command").and_then(Value::as_str) else {
            error!("Missing or invalid 'command' field in payload");
            self.lock()?.stats.failed_commands += 1;
            return Ok(CommandResult::InvalidParams);
        };
        info!("Processing command: {}", command_name);

        let schema_name = {
            let mut inner = self.lock()?;
            let found = inner
                .find_enabled(command_name)
                .map(|c| c.schema_name.clone());
            match found {
                Some(schema_name) => schema_name,
                None => {
                    warn!("Command not found: {}", command_name);
                    inner.stats.command_not_found_count += 1;
                    inner.stats.failed_commands += 1;
                    return Ok(CommandResult::NotFound);
                }
            }
        };

        if !schema_name.is_empty() {
            let passed = match self.validator.validate(topic, payload) {
                Ok(outcome) if outcome.is_valid() => true,
                Ok(outcome) => {
                    warn!(
                        "Schema validation failed for command '{}': {}",
                        command_name,
                        outcome.message()
                    );
                    false
                }
                Err(e) => {
                    warn!("Schema validation failed for command '{}': {}", command_name, e);
                    false
                }
            };
            if !passed {
                let mut inner = self.lock()?;
                inner.stats.schema_validation_failures += 1;
                inner.stats.failed_commands += 1;
                return Ok(CommandResult::SchemaInvalid);
            }
            info!("Schema validation passed for command '{}'", command_name);
        }

        // The registry may have changed while the validator ran.
        let handler = {
            let mut inner = self.lock()?;
            let now = self.clock.now_ms();
            let Some(index) = inner
                .commands
                .iter()
                .position(|c| c.enabled && c.name == command_name)
            else {
                warn!("Command disappeared during validation: {}", command_name);
                inner.stats.command_not_found_count += 1;
                inner.stats.failed_commands += 1;
                return Ok(CommandResult::NotFound);
            };
            let command = &mut inner.commands[index];
            command.execution_count += 1;
            command.last_execution_time_ms = now;
            Arc::clone(&command.handler)
        };

        let Some(mut ctx) = CommandContext::from_envelope(command_name, topic, payload, &root)
        else {
            error!("Failed to extract parameters for command '{}'", command_name);
            self.record_outcome(command_name, CommandResult::InvalidParams);
            return Ok(CommandResult::InvalidParams);
        };

        info!(
            "Executing command '{}' with {} parameters",
            command_name,
            ctx.param_count()
        );
        let result = handler.handle(&mut ctx);
        self.record_outcome(command_name, result);

        if !ctx.response.is_empty() {
            response.set(ctx.response.as_str());
        }

        Ok(result)
    }

    /// Books a handler outcome against the command and the global counters.
    ///
    /// The handler has already run at this point, so a lock timeout only
    /// costs the statistics update.
    fn record_outcome(&self, command_name: &str, result: CommandResult) {
        let mut inner = match self.lock() {
            Ok(inner) => inner,
            Err(e) => {
                warn!("Statistics for '{}' not recorded: {}", command_name, e);
                return;
            }
        };

        let success = result.is_success();
        if let Some(command) = inner.find_mut(command_name) {
            if success {
                command.success_count += 1;
            } else {
                command.failure_count += 1;
            }
        }
        if success {
            inner.stats.successful_commands += 1;
            info!("Command '{}' executed successfully", command_name);
        } else {
            inner.stats.failed_commands += 1;
            warn!("Command '{}' execution failed: {}", command_name, result);
        }
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("validator", &self.validator)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
