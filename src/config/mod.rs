mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    DeliverySettings, DispatcherSettings, LoggingSettings, RetrySettings, Settings,
    ValidatorSettings,
};

/// Prefix of environment variables read by `load_config`, e.g.
/// `TELECMD_DELIVERY__LOCK_TIMEOUT_MS=2000`.
pub const ENV_PREFIX: &str = "TELECMD";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
