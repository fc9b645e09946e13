//! Message lifecycle: run one attempt, then settle it in the store.
//!
//! ```text
//! Waiting --reserve--> Reserved --ok--------------------------> Done
//!                          |----retryable, attempts left-------> Waiting (attempt + 1)
//!                          |----fatal / exhausted / crashed----> Failed
//! ```
//!
//! [`Lifecycle::execute`] never touches the store, so the same code runs inline
//! and inside a re-entered worker process. The parent settles the outcome with
//! exactly one store mutation. A re-entered worker only reports finished or
//! retry through its exit code, so a permanent job failure there settles as done.

use crate::error::{JobError, JobResult};
use crate::hooks::ExecEvent;
use crate::job::{JobContext, JobRegistry};
use crate::message::{MessageId, ReservedMessage};
use crate::queue::Queue;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// How a reserved message was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Completed.
    Done,
    /// Re-queued under the given id with `attempt + 1`.
    RetryScheduled(MessageId),
    /// Failed for good: fatal error, retries exhausted, or the harness crashed.
    Failed,
}

/// What one attempt asks the store to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Retry,
    Failed,
}

impl AttemptOutcome {
    /// Finished means no further attempt; this is all a worker process reports.
    pub fn is_finished(self) -> bool {
        self != Self::Retry
    }

    fn from_finished(finished: bool) -> Self {
        if finished {
            Self::Completed
        } else {
            Self::Retry
        }
    }
}

/// Lifecycle engine bound to one queue.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    queue: Queue,
}

impl Lifecycle {
    pub fn new(queue: Queue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Runs one attempt of a payload and raises the exec hooks.
    ///
    /// Returns `true` when the message is finished (done, or failed for good) and
    /// `false` when another attempt was requested.
    pub async fn execute(
        &self,
        id: Option<MessageId>,
        payload: &str,
        ttr: u32,
        attempt: u32,
        worker_pid: Option<u32>,
    ) -> bool {
        self.run_attempt(id, payload, ttr, attempt, worker_pid)
            .await
            .is_finished()
    }

    /// Runs one attempt and classifies it without touching the store.
    pub async fn run_attempt(
        &self,
        id: Option<MessageId>,
        payload: &str,
        ttr: u32,
        attempt: u32,
        worker_pid: Option<u32>,
    ) -> AttemptOutcome {
        let job = match self.queue.registry().deserialize(payload) {
            Ok(job) => job,
            Err(error) => {
                let mut event =
                    ExecEvent::new(id, JobRegistry::job_name(payload), ttr, attempt, worker_pid);
                event.error = Some(error);
                self.queue.hooks().error(&event);
                return AttemptOutcome::Failed;
            }
        };

        let mut event = ExecEvent::new(id, Some(job.name().to_string()), ttr, attempt, worker_pid);
        self.queue.hooks().before_exec(&event);

        let ctx = JobContext::new(self.queue.clone(), id, ttr, attempt, worker_pid);
        let started = Instant::now();
        let result = job.run(&ctx).await;
        event.elapsed = Some(started.elapsed());

        match result {
            Ok(()) => {
                self.queue.hooks().after_exec(&event);
                AttemptOutcome::Completed
            }
            Err(error) => {
                let policy = job.policy();
                let policy = policy.as_ref().unwrap_or_else(|| self.queue.retry_policy());
                event.retry = error.is_retryable() && policy.should_retry(attempt);
                event.error = Some(error);
                self.queue.hooks().error(&event);
                if event.retry {
                    AttemptOutcome::Retry
                } else {
                    AttemptOutcome::Failed
                }
            }
        }
    }

    /// Applies the finished flag reported by [`execute`](Self::execute) to the store.
    pub async fn settle(&self, message: &ReservedMessage, finished: bool) -> JobResult<Resolution> {
        self.settle_outcome(message, AttemptOutcome::from_finished(finished))
            .await
    }

    /// Applies an attempt outcome to the store with exactly one mutation.
    pub async fn settle_outcome(
        &self,
        message: &ReservedMessage,
        outcome: AttemptOutcome,
    ) -> JobResult<Resolution> {
        let store = self.queue.store();
        match outcome {
            AttemptOutcome::Completed => {
                store.complete(message).await?;
                return Ok(Resolution::Done);
            }
            AttemptOutcome::Failed => {
                store.fail(message).await?;
                debug!(job_id = %message.id, attempt = message.attempt, "Message failed");
                return Ok(Resolution::Failed);
            }
            AttemptOutcome::Retry => {}
        }

        let delay = self
            .queue
            .registry()
            .deserialize(&message.payload)
            .ok()
            .and_then(|job| job.policy())
            .unwrap_or_else(|| self.queue.retry_policy().clone())
            .delay_for_attempt(message.attempt);

        let id = store.retry(message, delay).await?;
        debug!(
            job_id = %message.id,
            next_attempt = message.attempt + 1,
            delay_secs = delay.as_secs(),
            "Scheduled retry"
        );
        Ok(Resolution::RetryScheduled(id))
    }

    /// Executes a reserved message and settles it in one step.
    pub async fn process(
        &self,
        message: &ReservedMessage,
        worker_pid: Option<u32>,
    ) -> JobResult<Resolution> {
        let outcome = self
            .run_attempt(
                Some(message.id),
                &message.payload,
                message.ttr,
                message.attempt,
                worker_pid,
            )
            .await;
        self.settle_outcome(message, outcome).await
    }

    /// Harness failure path: the attempt never produced a job-level result.
    ///
    /// Raises `on_error` and fails the message without a requeue.
    pub async fn handle_crash(
        &self,
        message: &ReservedMessage,
        error: JobError,
        worker_pid: Option<u32>,
    ) -> JobResult<Resolution> {
        let mut event = ExecEvent::new(
            Some(message.id),
            JobRegistry::job_name(&message.payload),
            message.ttr,
            message.attempt,
            worker_pid,
        );
        event.error = Some(error);
        self.queue.hooks().error(&event);

        self.queue.store().fail(message).await?;
        Ok(Resolution::Failed)
    }
}
