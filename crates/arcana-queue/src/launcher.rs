//! Starting worker processes and reading their results.
//!
//! A worker process receives the payload on stdin and the delivery metadata as
//! arguments, runs one attempt and reports it through its exit code:
//! [`EXIT_DONE`] finished, [`EXIT_RETRY`] retry, anything else is a crash.

use crate::error::{JobError, JobResult};
use crate::message::MessageId;
use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Exit code of a finished attempt.
pub const EXIT_DONE: i32 = 0;

/// Exit code of an attempt that asks to be retried.
pub const EXIT_RETRY: i32 = 3;

/// Exit code used when re-entry itself fails before the job ran.
pub const EXIT_CRASH: i32 = 1;

/// Outcome of one isolated attempt.
#[derive(Debug)]
pub enum ExecResult {
    Done,
    Retry,
    Crash(JobError),
}

impl ExecResult {
    /// Maps the result of `Lifecycle::execute`.
    pub fn from_finished(finished: bool) -> Self {
        if finished {
            ExecResult::Done
        } else {
            ExecResult::Retry
        }
    }

    /// Classifies a process exit. `None` means the process was killed by a signal.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(EXIT_DONE) => ExecResult::Done,
            Some(EXIT_RETRY) => ExecResult::Retry,
            Some(code) => ExecResult::Crash(JobError::Process(format!(
                "worker exited with code {}",
                code
            ))),
            None => ExecResult::Crash(JobError::Process(
                "worker was terminated by a signal".to_string(),
            )),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ExecResult::Done => EXIT_DONE,
            ExecResult::Retry => EXIT_RETRY,
            ExecResult::Crash(_) => EXIT_CRASH,
        }
    }
}

/// What a launcher needs to start one attempt.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub id: Option<MessageId>,
    pub payload: String,
    pub ttr: u32,
    pub attempt: u32,
    /// PID of the worker loop that owns the pool.
    pub worker_pid: u32,
}

impl LaunchRequest {
    /// Re-entry arguments: `--id=<id> --ttr=<ttr> --attempt=<n> --pid=<pid>`.
    pub fn args(&self) -> Vec<String> {
        vec![
            format!(
                "--id={}",
                self.id.map(|id| id.to_string()).unwrap_or_default()
            ),
            format!("--ttr={}", self.ttr),
            format!("--attempt={}", self.attempt),
            format!("--pid={}", self.worker_pid),
        ]
    }
}

/// Everything a worker process produced.
#[derive(Debug, Default, Clone)]
pub struct ProcessOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A started worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if still known.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking check whether the process has exited.
    fn try_exit(&mut self) -> JobResult<bool>;

    /// Collects exit code and buffered output of an exited process.
    async fn finish(&mut self) -> JobResult<ProcessOutput>;
}

/// Strategy for starting worker processes.
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> JobResult<Box<dyn WorkerProcess>>;
}

/// Launches `<program> <args..> --id= --ttr= --attempt= --pid=` with the payload
/// on stdin.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-enter the running binary through its `exec` command.
    pub fn current_exe() -> JobResult<Self> {
        let program = std::env::current_exe().map_err(|e| {
            JobError::Configuration(format!("Cannot resolve current executable: {}", e))
        })?;
        Ok(Self::new(program).arg("exec"))
    }

    /// Append a fixed argument placed before the re-entry arguments.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, request: &LaunchRequest) -> JobResult<Box<dyn WorkerProcess>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(request.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(JobError::Spawn)?;

        debug!(
            pid = child.id(),
            program = %self.program.display(),
            attempt = request.attempt,
            "Started worker process"
        );

        let stdin = child.stdin.take().map(|mut stdin| {
            let payload = request.payload.clone();
            tokio::spawn(async move {
                stdin.write_all(payload.as_bytes()).await?;
                stdin.shutdown().await
            })
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        Ok(Box::new(ChildProcess {
            child,
            stdin,
            stdout,
            stderr,
        }))
    }
}

fn drain<R>(mut reader: R) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

async fn collect(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> JobResult<Vec<u8>> {
    match handle {
        None => Ok(Vec::new()),
        Some(handle) => handle
            .await
            .map_err(|e| JobError::Process(format!("output reader failed: {}", e)))?
            .map_err(|e| JobError::Process(format!("failed to read worker output: {}", e))),
    }
}

struct ChildProcess {
    child: Child,
    stdin: Option<JoinHandle<std::io::Result<()>>>,
    stdout: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    stderr: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> JobResult<bool> {
        self.child
            .try_wait()
            .map(|status| status.is_some())
            .map_err(|e| JobError::Process(format!("failed to poll worker: {}", e)))
    }

    async fn finish(&mut self) -> JobResult<ProcessOutput> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| JobError::Process(format!("failed to wait for worker: {}", e)))?;

        if let Some(stdin) = self.stdin.take() {
            // A child may exit without reading its payload.
            if let Ok(Err(e)) = stdin.await {
                trace!(error = %e, "Worker did not consume its payload");
            }
        }

        Ok(ProcessOutput {
            code: status.code(),
            stdout: collect(self.stdout.take()).await?,
            stderr: collect(self.stderr.take()).await?,
        })
    }
}
