//! Backing store contract.
//!
//! A store persists messages, hands out the next reservable one and tracks per-id
//! status. Every implementation must make `reserve` exclusive: an unfinished
//! message is never handed to two callers at once.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::JobResult;
use crate::message::{MessageId, PushOptions, ReservedMessage, Status};
use arcana_queue_config::{QueueConfig, StoreDriver};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Message counts reported by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Ready to be reserved.
    pub waiting: u64,
    /// Pushed with a delay that has not elapsed yet.
    pub delayed: u64,
    /// Currently reserved.
    pub reserved: u64,
    /// Total messages ever issued.
    pub total: u64,
}

impl QueueStats {
    /// Messages that reached a terminal state.
    pub fn done(&self) -> u64 {
        self.total
            .saturating_sub(self.waiting)
            .saturating_sub(self.delayed)
            .saturating_sub(self.reserved)
    }
}

/// Backing store contract.
#[async_trait]
pub trait Store: Send + Sync {
    /// Stores a serialized job and returns its id.
    async fn push(&self, payload: String, options: PushOptions) -> JobResult<MessageId>;

    /// Reserves the next message.
    ///
    /// With `timeout == None` returns immediately; otherwise waits up to `timeout`
    /// for a message to become available.
    async fn reserve(&self, timeout: Option<Duration>) -> JobResult<Option<ReservedMessage>>;

    /// Marks a reserved message done.
    ///
    /// Settlement operations apply only while `message` is the current
    /// reservation: its attempt is still the latest one handed out, even if its
    /// ttr has expired. A settlement from a reservation that has since been
    /// handed to another consumer is ignored.
    async fn complete(&self, message: &ReservedMessage) -> JobResult<()>;

    /// Re-queues a reserved message with `attempt + 1` after `delay`.
    ///
    /// Returns the id the message now lives under; stores may or may not keep
    /// the original id.
    async fn retry(&self, message: &ReservedMessage, delay: Duration) -> JobResult<MessageId>;

    /// Marks a reserved message permanently failed.
    async fn fail(&self, message: &ReservedMessage) -> JobResult<()>;

    /// Returns the status of a message. Unknown ids fail with `InvalidArgument`.
    async fn status(&self, id: MessageId) -> JobResult<Status>;

    /// Removes every pending message.
    async fn clear(&self) -> JobResult<()>;

    /// Removes one message. Returns false if it does not exist.
    async fn remove(&self, id: MessageId) -> JobResult<bool>;

    /// Current message counts.
    async fn stats(&self) -> JobResult<QueueStats>;
}

/// Opens the store selected by `store.driver`.
pub async fn connect(config: &QueueConfig) -> JobResult<Arc<dyn Store>> {
    info!(driver = %config.store.driver, "Opening queue store");
    Ok(match config.store.driver {
        StoreDriver::Memory => Arc::new(MemoryStore::new()) as Arc<dyn Store>,
        StoreDriver::Redis => Arc::new(RedisStore::connect(&config.redis).await?),
    })
}
