//! Built-in jobs available from the command line.

use arcana_queue::{Job, JobContext, JobError, QueueBuilder};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Job: create (or truncate) a file, typically a marker for tests and health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchFileJob {
    /// Path of the file to create.
    pub path: PathBuf,
}

#[async_trait]
impl Job for TouchFileJob {
    const NAME: &'static str = "touch_file";

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        tokio::fs::write(&self.path, b"")
            .await
            .map_err(|e| JobError::ExecutionFailed(format!("{}: {}", self.path.display(), e)))?;
        info!(path = %self.path.display(), attempt = ctx.attempt, "Touched file");
        Ok(())
    }
}

/// Job: sleep for a number of seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepJob {
    pub seconds: u64,
}

#[async_trait]
impl Job for SleepJob {
    const NAME: &'static str = "sleep";

    async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_secs(self.seconds)).await;
        Ok(())
    }
}

/// Job: print a message on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoJob {
    pub message: String,
}

#[async_trait]
impl Job for EchoJob {
    const NAME: &'static str = "echo";

    async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
        println!("{}", self.message);
        Ok(())
    }
}

/// Job: asks to be retried until `succeed_on_attempt`, then touches `path` if set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakyJob {
    pub succeed_on_attempt: u32,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[async_trait]
impl Job for FlakyJob {
    const NAME: &'static str = "flaky";

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.attempt < self.succeed_on_attempt {
            return Err(JobError::Retry(format!(
                "attempt {} of {}",
                ctx.attempt, self.succeed_on_attempt
            )));
        }
        if let Some(path) = &self.path {
            tokio::fs::write(path, ctx.attempt.to_string())
                .await
                .map_err(|e| JobError::ExecutionFailed(format!("{}: {}", path.display(), e)))?;
        }
        Ok(())
    }
}

/// Registers every built-in job.
pub fn register_builtin(builder: QueueBuilder) -> QueueBuilder {
    builder
        .register::<TouchFileJob>()
        .register::<SleepJob>()
        .register::<EchoJob>()
        .register::<FlakyJob>()
}
