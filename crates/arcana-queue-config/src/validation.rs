//! Configuration validation module.
//!
//! Collects every problem in one pass so an operator sees all of them at once.

use crate::{QueueConfig, StoreDriver};
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// A count or timeout that must be at least one is zero.
    ZeroValue { name: String },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: usize, maximum: usize },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Retry multiplier must be at least 1.0.
    InvalidMultiplier { value: f64 },
    /// Retry delays are inconsistent.
    InvalidDelayRange { initial: u64, max: u64 },
    /// Log level is invalid.
    InvalidLogLevel { value: String },
    /// Channel name is empty.
    EmptyChannel,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroValue { name } => write!(f, "'{}' must be greater than zero", name),
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(f, "Pool size {} exceeds maximum allowed ({})", value, maximum)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::InvalidMultiplier { value } => {
                write!(f, "Invalid retry multiplier: {} (must be >= 1.0)", value)
            }
            Self::InvalidDelayRange { initial, max } => write!(
                f,
                "Retry initial delay ({}s) cannot exceed max delay ({}s)",
                initial, max
            ),
            Self::InvalidLogLevel { value } => write!(
                f,
                "Invalid log level: '{}' (valid: trace, debug, info, warn, error)",
                value
            ),
            Self::EmptyChannel => write!(f, "Redis channel name cannot be empty"),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum worker processes or redis connections.
    const MAX_POOL_SIZE: usize = 1000;
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];

    /// Validates the entire queue configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &QueueConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_worker(config, &mut errors);
        Self::validate_job(config, &mut errors);
        Self::validate_retry(config, &mut errors);
        Self::validate_logging(config, &mut errors);
        if config.store.driver == StoreDriver::Redis {
            Self::validate_redis(config, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn require_non_zero(name: &str, value: u64, errors: &mut Vec<ConfigValidationError>) {
        if value == 0 {
            errors.push(ConfigValidationError::ZeroValue {
                name: name.to_string(),
            });
        }
    }

    fn validate_worker(config: &QueueConfig, errors: &mut Vec<ConfigValidationError>) {
        let worker = &config.worker;
        Self::require_non_zero("worker.max_processes", worker.max_processes as u64, errors);
        Self::require_non_zero("worker.poll_interval_ms", worker.poll_interval_ms, errors);
        Self::require_non_zero("worker.listen_timeout_secs", worker.listen_timeout_secs, errors);

        if worker.max_processes > Self::MAX_POOL_SIZE {
            errors.push(ConfigValidationError::PoolSizeTooLarge {
                value: worker.max_processes,
                maximum: Self::MAX_POOL_SIZE,
            });
        }
    }

    fn validate_job(config: &QueueConfig, errors: &mut Vec<ConfigValidationError>) {
        Self::require_non_zero("job.ttr_secs", u64::from(config.job.ttr_secs), errors);
    }

    fn validate_retry(config: &QueueConfig, errors: &mut Vec<ConfigValidationError>) {
        let retry = &config.retry;
        Self::require_non_zero("retry.max_attempts", u64::from(retry.max_attempts), errors);

        if retry.multiplier < 1.0 {
            errors.push(ConfigValidationError::InvalidMultiplier {
                value: retry.multiplier,
            });
        }
        if retry.initial_delay_secs > retry.max_delay_secs {
            errors.push(ConfigValidationError::InvalidDelayRange {
                initial: retry.initial_delay_secs,
                max: retry.max_delay_secs,
            });
        }
    }

    fn validate_logging(config: &QueueConfig, errors: &mut Vec<ConfigValidationError>) {
        let level = config.logging.level.to_lowercase();
        if !Self::VALID_LOG_LEVELS.contains(&level.as_str()) {
            errors.push(ConfigValidationError::InvalidLogLevel {
                value: config.logging.level.clone(),
            });
        }
    }

    fn validate_redis(config: &QueueConfig, errors: &mut Vec<ConfigValidationError>) {
        let redis = &config.redis;

        match Url::parse(&redis.url) {
            Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => {}
            Ok(url) => errors.push(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            }),
            Err(e) => errors.push(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: e.to_string(),
            }),
        }

        Self::require_non_zero("redis.pool_size", redis.pool_size as u64, errors);
        if redis.pool_size > Self::MAX_POOL_SIZE {
            errors.push(ConfigValidationError::PoolSizeTooLarge {
                value: redis.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }
        if redis.channel.trim().is_empty() {
            errors.push(ConfigValidationError::EmptyChannel);
        }
    }
}
