//! Producer-facing queue handle.

use crate::error::{JobError, JobResult};
use crate::hooks::{Hooks, PushEvent, QueueHook};
use crate::job::{Job, JobRegistry};
use crate::message::{MessageId, PushOptions, Status};
use crate::retry::RetryPolicy;
use crate::store::{MemoryStore, QueueStats, Store};
use arcana_queue_config::QueueConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Builder for pushing a job with options.
pub struct QueuedJob<J: Job> {
    job: J,
    ttr: Option<u32>,
    delay: Duration,
    priority: Option<u32>,
}

impl<J: Job> QueuedJob<J> {
    /// Create a new queued job builder.
    pub fn new(job: J) -> Self {
        Self {
            job,
            ttr: None,
            delay: Duration::ZERO,
            priority: None,
        }
    }

    /// Set the time to reserve, in seconds.
    pub fn ttr(mut self, ttr: u32) -> Self {
        self.ttr = Some(ttr);
        self
    }

    /// Set a delay before the first reservation.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the priority; lower values are reserved first.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    fn options(&self, defaults: &PushOptions) -> PushOptions {
        PushOptions {
            ttr: self.ttr.or(J::TTR_SECS).unwrap_or(defaults.ttr),
            delay: u32::try_from(self.delay.as_secs()).unwrap_or(u32::MAX),
            priority: self.priority.unwrap_or(defaults.priority),
        }
    }
}

struct QueueInner {
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    hooks: Hooks,
    retry_policy: RetryPolicy,
    defaults: PushOptions,
}

/// Cloneable handle over a store, a job registry and the registered hooks.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("registry", &self.inner.registry)
            .field("hooks", &self.inner.hooks)
            .field("retry_policy", &self.inner.retry_policy)
            .field("defaults", &self.inner.defaults)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Start building a queue.
    pub fn builder() -> QueueBuilder {
        QueueBuilder::new()
    }

    /// Push a job with default options.
    pub async fn push<J: Job>(&self, job: J) -> JobResult<MessageId> {
        self.push_with(QueuedJob::new(job)).await
    }

    /// Push a job with options.
    pub async fn push_with<J: Job>(&self, queued: QueuedJob<J>) -> JobResult<MessageId> {
        let options = queued.options(&self.inner.defaults);
        let payload = self.inner.registry.serialize(&queued.job)?;
        self.push_payload(J::NAME, payload, options).await
    }

    /// Push a registered job given by name and JSON data.
    pub async fn push_raw(
        &self,
        job_name: &str,
        data: serde_json::Value,
        options: PushOptions,
    ) -> JobResult<MessageId> {
        let payload = self.inner.registry.encode(job_name, data)?;
        self.push_payload(job_name, payload, options).await
    }

    async fn push_payload(
        &self,
        job_name: &str,
        payload: String,
        options: PushOptions,
    ) -> JobResult<MessageId> {
        if options.ttr == 0 {
            return Err(JobError::InvalidArgument(
                "ttr must be greater than zero".to_string(),
            ));
        }

        let id = self.inner.store.push(payload, options).await?;
        debug!(job_id = %id, job_name, ttr = options.ttr, "Pushed job");

        self.inner.hooks.push(&PushEvent {
            id,
            job_name: job_name.to_string(),
            ttr: options.ttr,
            delay: options.delay,
            priority: options.priority,
        });
        Ok(id)
    }

    /// Status of a message.
    pub async fn status(&self, id: MessageId) -> JobResult<Status> {
        self.inner.store.status(id).await
    }

    pub async fn is_waiting(&self, id: MessageId) -> JobResult<bool> {
        Ok(self.status(id).await? == Status::Waiting)
    }

    pub async fn is_reserved(&self, id: MessageId) -> JobResult<bool> {
        Ok(self.status(id).await? == Status::Reserved)
    }

    pub async fn is_done(&self, id: MessageId) -> JobResult<bool> {
        Ok(self.status(id).await? == Status::Done)
    }

    /// Removes every pending message.
    pub async fn clear(&self) -> JobResult<()> {
        self.inner.store.clear().await
    }

    /// Removes one message; fails with `NotFound` if it does not exist.
    pub async fn remove(&self, id: MessageId) -> JobResult<()> {
        if self.inner.store.remove(id).await? {
            Ok(())
        } else {
            Err(JobError::NotFound(format!("The message #{} is not found", id)))
        }
    }

    /// Current message counts.
    pub async fn stats(&self) -> JobResult<QueueStats> {
        self.inner.store.stats().await
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    /// Policy applied to jobs that do not carry their own.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    /// Options used when a push does not set them.
    pub fn defaults(&self) -> PushOptions {
        self.inner.defaults
    }
}

/// Builder for [`Queue`].
#[derive(Default)]
pub struct QueueBuilder {
    store: Option<Arc<dyn Store>>,
    registry: JobRegistry,
    hooks: Hooks,
    retry_policy: RetryPolicy,
    defaults: PushOptions,
}

impl QueueBuilder {
    /// Create a builder with an in-memory store and default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply retry and push defaults from configuration.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            retry_policy: RetryPolicy::from(&config.retry),
            defaults: PushOptions {
                ttr: config.job.ttr_secs,
                delay: 0,
                priority: config.job.priority,
            },
            ..Self::default()
        }
    }

    /// Use the given store.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a job type.
    pub fn register<J: Job>(mut self) -> Self {
        self.registry.register::<J>();
        self
    }

    /// Replace the job registry.
    pub fn registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add an observer.
    pub fn hook(mut self, hook: Arc<dyn QueueHook>) -> Self {
        self.hooks.add(hook);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Default time to reserve, in seconds.
    pub fn ttr(mut self, ttr: u32) -> Self {
        self.defaults.ttr = ttr;
        self
    }

    /// Default priority.
    pub fn priority(mut self, priority: u32) -> Self {
        self.defaults.priority = priority;
        self
    }

    pub fn build(self) -> Queue {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        Queue {
            inner: Arc::new(QueueInner {
                store,
                registry: Arc::new(self.registry),
                hooks: self.hooks,
                retry_policy: self.retry_policy,
                defaults: self.defaults,
            }),
        }
    }
}
