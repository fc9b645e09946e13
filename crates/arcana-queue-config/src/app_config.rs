//! Queue configuration structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Root configuration for a queue worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Backing store selection.
    #[serde(default)]
    pub store: StoreConfig,

    /// Redis connection configuration (used by the redis driver).
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker loop and process pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Defaults applied to pushed jobs.
    #[serde(default)]
    pub job: JobDefaults,

    /// Retry policy configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "arcana-queue".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Which store implementation backs the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// In-process FIFO, lost when the process exits.
    #[default]
    Memory,
    /// Redis-backed persistent store.
    Redis,
}

impl fmt::Display for StoreDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreDriver::Memory => write!(f, "memory"),
            StoreDriver::Redis => write!(f, "redis"),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store driver.
    #[serde(default)]
    pub driver: StoreDriver,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Channel name, used as the prefix of every key the queue owns.
    #[serde(default = "default_channel")]
    pub channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            channel: default_channel(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_channel() -> String {
    "queue".to_string()
}

/// Worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Execute every job in a child process.
    #[serde(default = "default_isolate")]
    pub isolate: bool,

    /// Maximum number of concurrently running child processes.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,

    /// How often the pool rechecks child liveness, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Seconds a listening worker blocks waiting for a new message.
    #[serde(default = "default_listen_timeout")]
    pub listen_timeout_secs: u64,

    /// Executable used to re-enter the worker in a child process.
    /// Defaults to the running executable.
    #[serde(default)]
    pub program: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            isolate: default_isolate(),
            max_processes: default_max_processes(),
            poll_interval_ms: default_poll_interval(),
            listen_timeout_secs: default_listen_timeout(),
            program: None,
        }
    }
}

fn default_isolate() -> bool {
    true
}

fn default_max_processes() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_listen_timeout() -> u64 {
    3
}

impl WorkerConfig {
    /// Returns the poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the listen timeout as Duration.
    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout_secs)
    }
}

/// Defaults applied to pushed jobs that do not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    /// Time to reserve in seconds.
    #[serde(default = "default_ttr")]
    pub ttr_secs: u32,

    /// Priority; lower values are reserved first.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            ttr_secs: default_ttr(),
            priority: default_priority(),
        }
    }
}

fn default_ttr() -> u32 {
    300
}

fn default_priority() -> u32 {
    1024
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of execution attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds.
    #[serde(default)]
    pub initial_delay_secs: u64,

    /// Maximum delay between retries, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: 0,
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_delay() -> u64 {
    3600
}

fn default_multiplier() -> f64 {
    2.0
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
