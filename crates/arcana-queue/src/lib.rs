//! Arcana Queue - Job Queue Runtime
//!
//! A job queue with pluggable stores and isolated execution:
//! - Typed job definitions with serde serialization
//! - In-memory and Redis stores with exclusive reservation and ttr reclaim
//! - Retry policies with fixed, linear or exponential backoff
//! - Priority and delayed delivery
//! - Inline execution, or one worker process per message with bounded concurrency
//! - Typed lifecycle hooks for logging and metrics
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Arcana Queue Architecture                     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producer ── Queue::push ──▶ ┌──────────────────────────────┐    │
//! │                              │  Store (memory | redis)      │    │
//! │                              │  waiting / delayed / reserved│    │
//! │                              └──────────────┬───────────────┘    │
//! │                                             │ reserve            │
//! │                                             ▼                    │
//! │  ┌────────────────────────────────────────────────────────┐      │
//! │  │ Worker (run | listen)                                  │      │
//! │  │    │                                                   │      │
//! │  │    ▼                                                   │      │
//! │  │ Dispatcher ──inline──▶ Lifecycle::execute + settle     │      │
//! │  │    │                                                   │      │
//! │  │    └──isolated──▶ WorkerPool ──▶ child `exec`          │      │
//! │  │                     │  exit 0 / 3 ──▶ Lifecycle::settle│      │
//! │  │                     └  other     ──▶ handle_crash      │      │
//! │  └────────────────────────────────────────────────────────┘      │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use arcana_queue::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmailJob {
//!     to: String,
//!     subject: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Job for SendEmailJob {
//!     const NAME: &'static str = "send_email";
//!
//!     async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
//!         // Send email logic
//!         Ok(())
//!     }
//! }
//!
//! let queue = Queue::builder().register::<SendEmailJob>().build();
//! queue
//!     .push_with(QueuedJob::new(SendEmailJob { to: "user@example.com".into(), subject: "Welcome!".into() }).priority(10))
//!     .await?;
//!
//! Worker::inline(queue).run().await?;
//! ```

pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod job;
pub mod launcher;
pub mod lifecycle;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use error::{JobError, JobResult};
pub use hooks::{ExecEvent, Hooks, LogHook, PushEvent, QueueHook};
pub use job::{DynJob, Job, JobContext, JobRegistry};
pub use launcher::{
    CommandLauncher, ExecResult, LaunchRequest, Launcher, ProcessOutput, WorkerProcess, EXIT_CRASH,
    EXIT_DONE, EXIT_RETRY,
};
pub use lifecycle::{AttemptOutcome, Lifecycle, Resolution};
pub use message::{MessageId, PushOptions, ReservedMessage, Status};
pub use metrics::{register_metrics, MetricsHook};
pub use pool::{CaptureSink, FinishCallback, OutputSink, StdioSink, WorkerPool};
pub use queue::{Queue, QueueBuilder, QueuedJob};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::{MemoryStore, QueueStats, RedisStore, Store};
pub use worker::{Worker, WorkerOptions};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::job::{Job, JobContext};
    pub use crate::message::{MessageId, Status};
    pub use crate::queue::{Queue, QueuedJob};
    pub use crate::retry::RetryPolicy;
    pub use crate::store::Store;
    pub use crate::worker::Worker;
    pub use crate::{JobError, JobResult};
}
