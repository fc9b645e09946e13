//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type JobResult<T> = Result<T, JobError>;

/// Queue, job and execution-harness errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job execution failed; retried while attempts remain.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// The job asked to be executed again.
    #[error("Job requested retry: {0}")]
    Retry(String),

    /// The job failed in a way another attempt cannot fix.
    #[error("Job failed permanently: {0}")]
    Fatal(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No job type is registered under this name.
    #[error("Unknown job type: {0}")]
    UnknownJob(String),

    /// Malformed or out-of-range id, ttr or attempt.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Message not found.
    #[error("Message not found: {0}")]
    NotFound(String),

    /// A worker process could not be started.
    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    /// A worker process crashed, was killed or exited with an unknown code.
    #[error("Worker process failed: {0}")]
    Process(String),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::ExecutionFailed(_) | JobError::Retry(_))
    }

    /// Returns true if the error came from the execution harness rather than the job.
    pub fn is_harness_failure(&self) -> bool {
        matches!(self, JobError::Spawn(_) | JobError::Process(_))
    }
}

impl From<arcana_queue_config::ConfigError> for JobError {
    fn from(err: arcana_queue_config::ConfigError) -> Self {
        JobError::Configuration(err.to_string())
    }
}
