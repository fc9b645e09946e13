//! Typed lifecycle hooks.
//!
//! Observers (logging, metrics, tests) implement [`QueueHook`] and are handed to
//! the queue at construction. The lifecycle engine and worker loop invoke every
//! registered hook synchronously, in registration order.

use crate::error::JobError;
use crate::message::MessageId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Raised after a message has been stored.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Id the store assigned.
    pub id: MessageId,
    /// Job type name.
    pub job_name: String,
    /// Time to reserve, in seconds.
    pub ttr: u32,
    /// Delay, in seconds.
    pub delay: u32,
    /// Priority.
    pub priority: u32,
}

/// One execution attempt, as seen by observers.
#[derive(Debug)]
pub struct ExecEvent {
    /// Message id, if known.
    pub id: Option<MessageId>,
    /// Job type name; `None` when the payload could not be decoded.
    pub job_name: Option<String>,
    /// Time to reserve, in seconds.
    pub ttr: u32,
    /// 1-based attempt number.
    pub attempt: u32,
    /// PID of the worker loop that reserved the message.
    pub worker_pid: Option<u32>,
    /// Why the attempt failed.
    pub error: Option<JobError>,
    /// Whether the message will be attempted again.
    pub retry: bool,
    /// Wall time spent executing, set on completion events.
    pub elapsed: Option<Duration>,
}

impl ExecEvent {
    pub(crate) fn new(
        id: Option<MessageId>,
        job_name: Option<String>,
        ttr: u32,
        attempt: u32,
        worker_pid: Option<u32>,
    ) -> Self {
        Self {
            id,
            job_name,
            ttr,
            attempt,
            worker_pid,
            error: None,
            retry: false,
            elapsed: None,
        }
    }

    /// Human-readable title, e.g. `[7] send_email (attempt: 2, PID: 4242)`.
    pub fn title(&self) -> String {
        let id = self.id.map(|id| id.to_string()).unwrap_or_default();
        let name = self.job_name.as_deref().unwrap_or("unknown job");
        match self.worker_pid {
            Some(pid) => format!("[{}] {} (attempt: {}, PID: {})", id, name, self.attempt, pid),
            None => format!("[{}] {} (attempt: {})", id, name, self.attempt),
        }
    }
}

impl fmt::Display for ExecEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title())
    }
}

/// Observer of queue lifecycle events. All methods default to no-ops.
pub trait QueueHook: Send + Sync {
    /// A message was pushed.
    fn on_push(&self, _event: &PushEvent) {}

    /// A job is about to execute.
    fn on_before_exec(&self, _event: &ExecEvent) {}

    /// A job finished without error.
    fn on_after_exec(&self, _event: &ExecEvent) {}

    /// A job or its worker process failed. `event.retry` tells whether it will run again.
    fn on_error(&self, _event: &ExecEvent) {}

    /// A worker loop started.
    fn on_worker_start(&self, _pid: u32) {}

    /// A worker loop stopped.
    fn on_worker_stop(&self, _pid: u32) {}
}

/// The set of hooks registered on a queue.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Arc<dyn QueueHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").field("count", &self.hooks.len()).finish()
    }
}

impl Hooks {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook.
    pub fn add(&mut self, hook: Arc<dyn QueueHook>) {
        self.hooks.push(hook);
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) fn push(&self, event: &PushEvent) {
        self.hooks.iter().for_each(|h| h.on_push(event));
    }

    pub(crate) fn before_exec(&self, event: &ExecEvent) {
        self.hooks.iter().for_each(|h| h.on_before_exec(event));
    }

    pub(crate) fn after_exec(&self, event: &ExecEvent) {
        self.hooks.iter().for_each(|h| h.on_after_exec(event));
    }

    pub(crate) fn error(&self, event: &ExecEvent) {
        self.hooks.iter().for_each(|h| h.on_error(event));
    }

    pub(crate) fn worker_start(&self, pid: u32) {
        self.hooks.iter().for_each(|h| h.on_worker_start(pid));
    }

    pub(crate) fn worker_stop(&self, pid: u32) {
        self.hooks.iter().for_each(|h| h.on_worker_stop(pid));
    }
}

/// Writes lifecycle events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHook;

impl QueueHook for LogHook {
    fn on_push(&self, event: &PushEvent) {
        info!(
            job_id = %event.id,
            job_name = %event.job_name,
            delay = event.delay,
            "[{}] {} is pushed.",
            event.id,
            event.job_name
        );
    }

    fn on_before_exec(&self, event: &ExecEvent) {
        info!(attempt = event.attempt, "{} is started.", event);
    }

    fn on_after_exec(&self, event: &ExecEvent) {
        info!(
            attempt = event.attempt,
            elapsed_ms = event.elapsed.map(|d| d.as_millis() as u64),
            "{} is finished.",
            event
        );
    }

    fn on_error(&self, event: &ExecEvent) {
        let cause = event
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        error!(
            attempt = event.attempt,
            retry = event.retry,
            elapsed_ms = event.elapsed.map(|d| d.as_millis() as u64),
            "{} is finished with error: {}.",
            event,
            cause
        );
    }

    fn on_worker_start(&self, pid: u32) {
        info!(pid, "Worker {} is started.", pid);
    }

    fn on_worker_stop(&self, pid: u32) {
        info!(pid, "Worker {} is stopped.", pid);
    }
}
