//! Inline or isolated execution of reserved messages.

use crate::error::JobResult;
use crate::lifecycle::Lifecycle;
use crate::message::ReservedMessage;
use crate::pool::{FinishCallback, WorkerPool};
use tracing::{debug, warn};

/// Routes each reserved message to the current process or to a worker process.
#[derive(Debug)]
pub enum Dispatcher {
    /// Execute in this process and settle immediately.
    Inline(Lifecycle),
    /// Execute in a child process; the pool settles when it exits.
    Isolated(WorkerPool),
}

impl Dispatcher {
    pub fn inline(lifecycle: Lifecycle) -> Self {
        Dispatcher::Inline(lifecycle)
    }

    pub fn isolated(pool: WorkerPool) -> Self {
        Dispatcher::Isolated(pool)
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self, Dispatcher::Isolated(_))
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        match self {
            Dispatcher::Inline(lifecycle) => lifecycle,
            Dispatcher::Isolated(pool) => pool.lifecycle(),
        }
    }

    /// Runs or submits one message.
    ///
    /// A delivery with a zero ttr or attempt never runs; it fails through the
    /// crash path and the caller keeps going.
    pub async fn dispatch(&mut self, message: ReservedMessage, worker_pid: u32) -> JobResult<()> {
        if let Err(error) = message.validate() {
            warn!(job_id = %message.id, error = %error, "Rejected invalid delivery");
            self.lifecycle()
                .handle_crash(&message, error, Some(worker_pid))
                .await?;
            return Ok(());
        }
        debug!(
            job_id = %message.id,
            attempt = message.attempt,
            isolated = self.is_isolated(),
            "Dispatching message"
        );

        match self {
            Dispatcher::Inline(lifecycle) => {
                lifecycle.process(&message, Some(worker_pid)).await?;
            }
            Dispatcher::Isolated(pool) => {
                let lifecycle = pool.lifecycle().clone();
                let settled = message.clone();
                let on_finish: FinishCallback = Box::new(move |finished| {
                    Box::pin(async move {
                        lifecycle.settle(&settled, finished).await.map(|_| ())
                    })
                });
                pool.submit(message, on_finish).await?;
            }
        }
        Ok(())
    }

    /// Settles whatever has already finished without waiting.
    pub async fn poll(&mut self) -> JobResult<()> {
        if let Dispatcher::Isolated(pool) = self {
            pool.reap().await?;
        }
        Ok(())
    }

    /// Waits for every outstanding isolated attempt.
    pub async fn drain(&mut self) -> JobResult<()> {
        match self {
            Dispatcher::Inline(_) => Ok(()),
            Dispatcher::Isolated(pool) => pool.drain().await,
        }
    }

    /// Attempts currently in flight.
    pub fn active(&self) -> usize {
        match self {
            Dispatcher::Inline(_) => 0,
            Dispatcher::Isolated(pool) => pool.active(),
        }
    }
}
