//! Retry policies for failed jobs.

use arcana_queue_config::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// No retry.
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff.
    Exponential,
    /// Linear backoff.
    Linear,
}

/// Retry policy: how many attempts a message gets and how long to wait between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds.
    pub initial_delay_secs: u64,

    /// Maximum delay in seconds.
    pub max_delay_secs: u64,

    /// Backoff multiplier (for exponential).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: config.max_attempts,
            initial_delay_secs: config.initial_delay_secs,
            max_delay_secs: config.max_delay_secs,
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing a single attempt.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_attempts: 1,
            initial_delay_secs: 0,
            max_delay_secs: 0,
            multiplier: 1.0,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(max_attempts: u32, delay_secs: u64) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts,
            initial_delay_secs: delay_secs,
            max_delay_secs: delay_secs,
            multiplier: 1.0,
        }
    }

    /// Creates an exponential backoff retry policy starting at one second.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts,
            initial_delay_secs: 1,
            max_delay_secs: 3600,
            multiplier: 2.0,
        }
    }

    /// Creates a linear backoff retry policy.
    pub fn linear(max_attempts: u32, increment_secs: u64) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            max_attempts,
            initial_delay_secs: increment_secs,
            max_delay_secs: increment_secs * u64::from(max_attempts),
            multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_secs = delay.as_secs();
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_secs = delay.as_secs();
        self
    }

    /// Returns true if a message that just failed `attempt` may run again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.strategy != RetryStrategy::None && attempt < self.max_attempts
    }

    /// Delay before re-queueing a message whose `attempt` just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.strategy == RetryStrategy::None {
            return Duration::ZERO;
        }

        let base_delay = match self.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::Fixed => self.initial_delay_secs,
            RetryStrategy::Exponential => {
                let delay =
                    self.initial_delay_secs as f64 * self.multiplier.powi((attempt - 1) as i32);
                delay as u64
            }
            RetryStrategy::Linear => self.initial_delay_secs * u64::from(attempt),
        };

        Duration::from_secs(base_delay.min(self.max_delay_secs))
    }
}
