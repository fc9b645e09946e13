//! Worker control loop: reserve, dispatch, settle.

use crate::dispatcher::Dispatcher;
use crate::error::{JobError, JobResult};
use crate::launcher::{CommandLauncher, ExecResult, Launcher};
use crate::lifecycle::Lifecycle;
use crate::message::{validate_delivery, MessageId};
use crate::pool::WorkerPool;
use crate::queue::Queue;
use arcana_queue_config::WorkerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Worker loop settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Run each message in its own worker process.
    pub isolate: bool,

    /// Maximum concurrent worker processes.
    pub max_processes: usize,

    /// How often the pool polls its processes.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            isolate: config.isolate,
            max_processes: config.max_processes,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Consumes one queue until it is empty (`run`) or until shutdown (`listen`).
#[derive(Debug)]
pub struct Worker {
    queue: Queue,
    dispatcher: Dispatcher,
    pid: u32,
}

impl Worker {
    /// Build a worker; isolated mode re-enters the current executable.
    pub fn new(queue: Queue, options: &WorkerOptions) -> JobResult<Self> {
        if !options.isolate {
            return Ok(Self::inline(queue));
        }
        let launcher = CommandLauncher::current_exe()?;
        Ok(Self::with_launcher(queue, options, Arc::new(launcher)))
    }

    /// Execute every message in this process.
    pub fn inline(queue: Queue) -> Self {
        let dispatcher = Dispatcher::inline(Lifecycle::new(queue.clone()));
        Self::with_dispatcher(queue, dispatcher)
    }

    /// Execute every message in a process started by `launcher`.
    pub fn with_launcher(queue: Queue, options: &WorkerOptions, launcher: Arc<dyn Launcher>) -> Self {
        let pool = WorkerPool::new(
            launcher,
            Lifecycle::new(queue.clone()),
            options.max_processes,
            options.poll_interval,
        );
        Self::with_dispatcher(queue, Dispatcher::isolated(pool))
    }

    pub fn with_dispatcher(queue: Queue, dispatcher: Dispatcher) -> Self {
        Self {
            queue,
            dispatcher,
            pid: std::process::id(),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Processes every message available now, waits for isolated attempts, then returns.
    ///
    /// Returns the number of messages dispatched.
    pub async fn run(&mut self) -> JobResult<u64> {
        self.queue.hooks().worker_start(self.pid);
        let result = self.run_until_empty().await;
        self.queue.hooks().worker_stop(self.pid);
        result
    }

    async fn run_until_empty(&mut self) -> JobResult<u64> {
        let mut dispatched = 0;
        loop {
            match self.queue.store().reserve(None).await? {
                Some(message) => {
                    self.dispatcher.dispatch(message, self.pid).await?;
                    dispatched += 1;
                }
                None if self.dispatcher.active() == 0 => return Ok(dispatched),
                // Settling may requeue retries that are ready right away.
                None => self.dispatcher.drain().await?,
            }
        }
    }

    /// Processes messages as they arrive until `shutdown` turns true.
    ///
    /// Each reservation blocks for at most `timeout`, which must be at least one
    /// second. Outstanding isolated attempts are drained before returning.
    pub async fn listen(
        &mut self,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JobResult<u64> {
        if timeout < Duration::from_secs(1) {
            return Err(JobError::InvalidArgument(
                "listen timeout must be at least one second".to_string(),
            ));
        }

        self.queue.hooks().worker_start(self.pid);
        info!(timeout_secs = timeout.as_secs(), "Listening for messages");
        let result = self.listen_until(timeout, &mut shutdown).await;
        self.queue.hooks().worker_stop(self.pid);
        result
    }

    async fn listen_until(
        &mut self,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> JobResult<u64> {
        let store = self.queue.store().clone();
        let mut dispatched = 0;

        while !*shutdown.borrow() {
            let reserved = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                reserved = store.reserve(Some(timeout)) => reserved?,
            };

            match reserved {
                Some(message) => {
                    self.dispatcher.dispatch(message, self.pid).await?;
                    dispatched += 1;
                }
                None => self.dispatcher.poll().await?,
            }
        }

        info!(active = self.dispatcher.active(), "Shutting down, draining worker processes");
        self.dispatcher.drain().await?;
        Ok(dispatched)
    }

    /// Child side of isolated execution: runs one attempt of `payload`.
    ///
    /// Never touches the store; the parent settles from the exit code.
    pub async fn exec(
        queue: &Queue,
        id: Option<MessageId>,
        ttr: u32,
        attempt: u32,
        worker_pid: Option<u32>,
        payload: &str,
    ) -> ExecResult {
        if let Err(error) = validate_delivery(ttr, attempt) {
            return ExecResult::Crash(error);
        }
        debug!(job_id = ?id, attempt, "Executing re-entered message");

        let finished = Lifecycle::new(queue.clone())
            .execute(id, payload, ttr, attempt, worker_pid)
            .await;
        ExecResult::from_finished(finished)
    }
}
