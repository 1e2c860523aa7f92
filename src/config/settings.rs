use std::time::Duration;

use serde::Deserialize;

use crate::delivery::{DeliveryConfig, RetryPolicy};

/// Top-level configuration settings for the application.
///
/// One section per component plus logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub validator: ValidatorSettings,
    pub dispatcher: DispatcherSettings,
    pub delivery: DeliverySettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ValidatorSettings {
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub lock_timeout_ms: u64,
}

/// Configuration settings for the delivery queue and its worker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeliverySettings {
    pub lock_timeout_ms: u64,
    pub queue_check_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    pub auto_cleanup_expired: bool,
    pub priority_based_processing: bool,
    /// Policy for messages enqueued without one.
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub exponential_backoff: bool,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every value is optional; missing ones are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub logging: Option<PartialLoggingSettings>,
    pub validator: Option<PartialLockSettings>,
    pub dispatcher: Option<PartialLockSettings>,
    pub delivery: Option<PartialDeliverySettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLockSettings {
    pub lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDeliverySettings {
    pub lock_timeout_ms: Option<u64>,
    pub queue_check_interval_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
    pub auto_cleanup_expired: Option<bool>,
    pub priority_based_processing: Option<bool>,
    pub retry: Option<PartialRetrySettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRetrySettings {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_delay_ms: Option<u64>,
    pub exponential_backoff: Option<bool>,
}

impl Default for Settings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            validator: ValidatorSettings {
                lock_timeout_ms: 1000,
            },
            dispatcher: DispatcherSettings {
                lock_timeout_ms: 1000,
            },
            delivery: DeliverySettings {
                lock_timeout_ms: 5000,
                queue_check_interval_ms: 1000,
                cleanup_interval_ms: 10_000,
                auto_cleanup_expired: true,
                priority_based_processing: true,
                retry: RetrySettings {
                    max_retries: retry.max_retries,
                    base_delay_ms: retry.base_delay_ms,
                    backoff_multiplier: retry.backoff_multiplier,
                    max_delay_ms: retry.max_delay_ms,
                    exponential_backoff: retry.exponential_backoff,
                },
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let logging = self.logging.unwrap_or_default();
        let validator = self.validator.unwrap_or_default();
        let dispatcher = self.dispatcher.unwrap_or_default();

        Settings {
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
            validator: ValidatorSettings {
                lock_timeout_ms: validator
                    .lock_timeout_ms
                    .unwrap_or(default.validator.lock_timeout_ms),
            },
            dispatcher: DispatcherSettings {
                lock_timeout_ms: dispatcher
                    .lock_timeout_ms
                    .unwrap_or(default.dispatcher.lock_timeout_ms),
            },
            delivery: self.delivery.unwrap_or_default().merge(default.delivery),
        }
    }
}

impl PartialDeliverySettings {
    fn merge(self, default: DeliverySettings) -> DeliverySettings {
        let retry = self.retry.unwrap_or_default();
        DeliverySettings {
            lock_timeout_ms: self.lock_timeout_ms.unwrap_or(default.lock_timeout_ms),
            queue_check_interval_ms: self
                .queue_check_interval_ms
                .unwrap_or(default.queue_check_interval_ms),
            cleanup_interval_ms: self
                .cleanup_interval_ms
                .unwrap_or(default.cleanup_interval_ms),
            auto_cleanup_expired: self
                .auto_cleanup_expired
                .unwrap_or(default.auto_cleanup_expired),
            priority_based_processing: self
                .priority_based_processing
                .unwrap_or(default.priority_based_processing),
            retry: RetrySettings {
                max_retries: retry.max_retries.unwrap_or(default.retry.max_retries),
                base_delay_ms: retry.base_delay_ms.unwrap_or(default.retry.base_delay_ms),
                backoff_multiplier: retry
                    .backoff_multiplier
                    .unwrap_or(default.retry.backoff_multiplier),
                max_delay_ms: retry.max_delay_ms.unwrap_or(default.retry.max_delay_ms),
                exponential_backoff: retry
                    .exponential_backoff
                    .unwrap_or(default.retry.exponential_backoff),
            },
        }
    }
}

impl ValidatorSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl DispatcherSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl DeliverySettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Queue options without a sink; the caller attaches the transport.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            sink: None,
            default_retry_policy: RetryPolicy::from(&self.retry),
            queue_check_interval: Duration::from_millis(self.queue_check_interval_ms),
            cleanup_interval: Duration::from_millis(self.cleanup_interval_ms),
            auto_cleanup_expired: self.auto_cleanup_expired,
            priority_based_processing: self.priority_based_processing,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(retry: &RetrySettings) -> Self {
        Self {
            max_retries: retry.max_retries,
            base_delay_ms: retry.base_delay_ms,
            backoff_multiplier: retry.backoff_multiplier,
            max_delay_ms: retry.max_delay_ms,
            exponential_backoff: retry.exponential_backoff,
        }
    }
}
