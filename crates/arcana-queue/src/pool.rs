//! Bounded pool of worker processes, one reserved message per process.
//!
//! The pool is driven by a single control loop (`&mut self` everywhere) and
//! polls its children instead of waiting on them. Each reap routes buffered
//! output to an [`OutputSink`] and classifies the exit: done and retry go to
//! the slot's completion callback, anything else to
//! [`Lifecycle::handle_crash`].

use crate::error::JobResult;
use crate::launcher::{ExecResult, LaunchRequest, Launcher, WorkerProcess};
use crate::lifecycle::Lifecycle;
use crate::message::ReservedMessage;
use crate::metrics::record_worker_exit;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Called with `true` (finished) or `false` (retry) once an isolated attempt exits cleanly.
pub type FinishCallback = Box<dyn FnOnce(bool) -> BoxFuture<'static, JobResult<()>> + Send>;

/// Destination of worker output.
pub trait OutputSink: Send {
    fn stdout(&mut self, data: &[u8]);
    fn stderr(&mut self, data: &[u8]);
}

/// Forwards worker output to this process's stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl OutputSink for StdioSink {
    fn stdout(&mut self, data: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(data).and_then(|()| out.flush());
    }

    fn stderr(&mut self, data: &[u8]) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(data).and_then(|()| err.flush());
    }
}

/// Collects worker output in memory. Clones share the same buffers.
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock()).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock()).into_owned()
    }
}

impl OutputSink for CaptureSink {
    fn stdout(&mut self, data: &[u8]) {
        self.stdout.lock().extend_from_slice(data);
    }

    fn stderr(&mut self, data: &[u8]) {
        self.stderr.lock().extend_from_slice(data);
    }
}

/// One running attempt.
struct WorkerSlot {
    process: Box<dyn WorkerProcess>,
    message: ReservedMessage,
    on_finish: FinishCallback,
}

/// Bounded set of worker processes.
pub struct WorkerPool {
    launcher: Arc<dyn Launcher>,
    lifecycle: Lifecycle,
    max_processes: usize,
    poll_interval: Duration,
    worker_pid: u32,
    slots: Vec<WorkerSlot>,
    sink: Box<dyn OutputSink>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_processes", &self.max_processes)
            .field("poll_interval", &self.poll_interval)
            .field("active", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a pool. `max_processes` is at least 1.
    pub fn new(
        launcher: Arc<dyn Launcher>,
        lifecycle: Lifecycle,
        max_processes: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            launcher,
            lifecycle,
            max_processes: max_processes.max(1),
            poll_interval,
            worker_pid: std::process::id(),
            slots: Vec::new(),
            sink: Box::new(StdioSink),
        }
    }

    /// Route worker output somewhere other than stdio.
    pub fn with_sink(mut self, sink: Box<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn max_processes(&self) -> usize {
        self.max_processes
    }

    /// Number of running worker processes.
    pub fn active(&self) -> usize {
        self.slots.len()
    }

    /// Starts a worker process for `message`, waiting for a free slot first.
    ///
    /// Returns once the process is started. A process that cannot be started is
    /// treated as a crash and does not take a slot.
    pub async fn submit(&mut self, message: ReservedMessage, on_finish: FinishCallback) -> JobResult<()> {
        self.reap().await?;
        while self.slots.len() >= self.max_processes {
            trace!(active = self.slots.len(), "Pool is full, waiting");
            tokio::time::sleep(self.poll_interval).await;
            self.reap().await?;
        }

        let request = LaunchRequest {
            id: Some(message.id),
            payload: message.payload.clone(),
            ttr: message.ttr,
            attempt: message.attempt,
            worker_pid: self.worker_pid,
        };

        match self.launcher.launch(&request) {
            Ok(process) => {
                debug!(
                    job_id = %message.id,
                    pid = process.pid(),
                    active = self.slots.len() + 1,
                    "Submitted message to worker process"
                );
                self.slots.push(WorkerSlot {
                    process,
                    message,
                    on_finish,
                });
            }
            Err(error) => {
                self.lifecycle
                    .handle_crash(&message, error, Some(self.worker_pid))
                    .await?;
            }
        }
        Ok(())
    }

    /// Settles every exited process. Returns how many were reaped.
    pub async fn reap(&mut self) -> JobResult<usize> {
        let mut reaped = 0;
        let mut index = 0;
        while index < self.slots.len() {
            let exited = self.slots[index].process.try_exit();
            if matches!(exited, Ok(false)) {
                index += 1;
                continue;
            }

            let mut slot = self.slots.remove(index);
            let result = match exited {
                Ok(_) => match slot.process.finish().await {
                    Ok(output) => {
                        self.sink.stdout(&output.stdout);
                        self.sink.stderr(&output.stderr);
                        ExecResult::from_exit_code(output.code)
                    }
                    Err(error) => ExecResult::Crash(error),
                },
                Err(error) => ExecResult::Crash(error),
            };
            reaped += 1;
            record_worker_exit(&result);

            match result {
                ExecResult::Done => (slot.on_finish)(true).await?,
                ExecResult::Retry => (slot.on_finish)(false).await?,
                ExecResult::Crash(error) => {
                    self.lifecycle
                        .handle_crash(&slot.message, error, Some(self.worker_pid))
                        .await?;
                }
            }
        }
        Ok(reaped)
    }

    /// Waits until every worker process has exited and been settled.
    pub async fn drain(&mut self) -> JobResult<()> {
        loop {
            self.reap().await?;
            if self.slots.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
