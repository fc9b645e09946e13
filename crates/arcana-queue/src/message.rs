//! Message envelope, ids and store-level status.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Store-assigned message identifier, unique and monotonic per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    /// Creates an id from its numeric value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for MessageId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(JobError::InvalidArgument(format!("Unknown message ID: {}", s))),
            Ok(v) => Ok(Self(v)),
        }
    }
}

/// Delivery options attached to a message at push time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOptions {
    /// Time to reserve, in seconds.
    pub ttr: u32,
    /// Visibility delay before the first reservation, in seconds.
    pub delay: u32,
    /// Ordering hint; lower values are reserved first.
    pub priority: u32,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            ttr: 300,
            delay: 0,
            priority: 1024,
        }
    }
}

impl PushOptions {
    /// Returns the ttr as Duration.
    pub fn ttr_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttr))
    }

    /// Returns the delay as Duration.
    pub fn delay_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.delay))
    }
}

/// A message handed out by `Store::reserve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedMessage {
    /// Message id.
    pub id: MessageId,
    /// Serialized job.
    pub payload: String,
    /// Time to reserve, in seconds.
    pub ttr: u32,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Priority the message was pushed with.
    pub priority: u32,
}

impl ReservedMessage {
    /// Rejects a zero ttr or attempt before the message reaches an executor.
    pub fn validate(&self) -> JobResult<()> {
        validate_delivery(self.ttr, self.attempt)
    }
}

/// Shared validation for reserved messages and re-entry arguments.
pub(crate) fn validate_delivery(ttr: u32, attempt: u32) -> JobResult<()> {
    if ttr == 0 {
        return Err(JobError::InvalidArgument("ttr must be greater than zero".to_string()));
    }
    if attempt == 0 {
        return Err(JobError::InvalidArgument(
            "attempt must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Store-level message status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Pushed (possibly delayed) and not yet reserved.
    Waiting,
    /// Reserved by a consumer.
    Reserved,
    /// Completed or permanently failed.
    Done,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Waiting => write!(f, "waiting"),
            Status::Reserved => write!(f, "reserved"),
            Status::Done => write!(f, "done"),
        }
    }
}
