//! Command implementations. Each returns the process exit code.

use crate::cli::{Commands, ExecArgs, PushArgs, WorkerArgs};
use crate::startup::{build_queue, launcher, shutdown_channel};
use anyhow::{bail, Context, Result};
use arcana_queue::{
    metrics, ExecResult, MessageId, PushOptions, Queue, QueueStats, Worker, WorkerOptions,
};
use arcana_queue_config::{QueueConfig, StoreDriver};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

/// Runs `command` against the queue described by `config`.
pub async fn execute(command: Commands, config: &QueueConfig, config_dir: &str) -> Result<i32> {
    let queue = build_queue(config)
        .await
        .context("Failed to open the queue")?;

    match command {
        Commands::Info => info(&queue).await,
        Commands::Run(args) => run(queue, config, config_dir, &args).await,
        Commands::Listen { timeout, worker } => {
            let timeout = timeout.unwrap_or(config.worker.listen_timeout_secs);
            listen(queue, config, config_dir, &worker, Duration::from_secs(timeout)).await
        }
        Commands::Exec(args) => exec(&queue, &args).await,
        Commands::Clear { yes } => clear(&queue, yes).await,
        Commands::Remove { id } => remove(&queue, id).await,
        Commands::Push(args) => {
            if let Some(message) = ephemeral_store_warning(config) {
                warn!("{}", message);
            }
            push(&queue, &args).await
        }
    }
}

/// Warning for pushes into a store that dies with this process.
pub fn ephemeral_store_warning(config: &QueueConfig) -> Option<String> {
    match config.store.driver {
        StoreDriver::Memory => Some(
            "The memory store lives only as long as this command; \
             no other worker will see the pushed message. Use the redis driver."
                .to_string(),
        ),
        StoreDriver::Redis => None,
    }
}

/// Formats store counts the way `info` prints them.
pub fn format_stats(stats: &QueueStats) -> String {
    format!(
        "Jobs\n- waiting: {}\n- delayed: {}\n- reserved: {}\n- done: {}",
        stats.waiting,
        stats.delayed,
        stats.reserved,
        stats.done()
    )
}

async fn info(queue: &Queue) -> Result<i32> {
    let stats = queue.stats().await?;
    metrics::record_stats(&stats);
    println!("{}", format_stats(&stats));
    Ok(0)
}

fn worker(queue: Queue, config: &QueueConfig, config_dir: &str, args: &WorkerArgs) -> Result<Worker> {
    let mut options = WorkerOptions::from(&config.worker);
    if args.inline {
        options.isolate = false;
    }
    if let Some(max) = args.max_processes {
        options.max_processes = max;
    }

    if !options.isolate {
        return Ok(Worker::inline(queue));
    }
    let launcher = launcher(config, config_dir)?;
    info!(
        program = %launcher.program().display(),
        max_processes = options.max_processes,
        "Running jobs in isolated worker processes"
    );
    Ok(Worker::with_launcher(queue, &options, Arc::new(launcher)))
}

async fn run(queue: Queue, config: &QueueConfig, config_dir: &str, args: &WorkerArgs) -> Result<i32> {
    let mut worker = worker(queue, config, config_dir, args)?;
    let dispatched = worker.run().await?;
    info!(dispatched, "Queue is empty");
    Ok(0)
}

async fn listen(
    queue: Queue,
    config: &QueueConfig,
    config_dir: &str,
    args: &WorkerArgs,
    timeout: Duration,
) -> Result<i32> {
    let mut worker = worker(queue, config, config_dir, args)?;
    let dispatched = worker.listen(timeout, shutdown_channel()).await?;
    info!(dispatched, "Listener stopped");
    Ok(0)
}

/// Parses the `--id` of a re-entry, which may be empty.
pub fn parse_exec_id(raw: &str) -> Result<Option<MessageId>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(raw.parse()?))
}

async fn exec(queue: &Queue, args: &ExecArgs) -> Result<i32> {
    let id = parse_exec_id(&args.id)?;
    let worker_pid = (args.pid != 0).then_some(args.pid);

    let mut payload = String::new();
    tokio::io::stdin()
        .read_to_string(&mut payload)
        .await
        .context("Failed to read the message from stdin")?;

    let result = Worker::exec(queue, id, args.ttr, args.attempt, worker_pid, &payload).await;
    if let ExecResult::Crash(e) = &result {
        error!(job_id = ?id, "Re-entry failed: {}", e);
    }
    Ok(result.exit_code())
}

async fn clear(queue: &Queue, confirmed: bool) -> Result<i32> {
    if !confirmed {
        bail!("Refusing to clear the queue without --yes");
    }
    queue.clear().await?;
    println!("Queue has been cleared.");
    Ok(0)
}

async fn remove(queue: &Queue, id: u64) -> Result<i32> {
    let id = MessageId::new(id);
    queue.remove(id).await?;
    println!("The message #{} has been removed.", id);
    Ok(0)
}

async fn push(queue: &Queue, args: &PushArgs) -> Result<i32> {
    let data: serde_json::Value =
        serde_json::from_str(&args.data).context("Job data must be valid JSON")?;
    let defaults = queue.defaults();
    let options = PushOptions {
        ttr: args.ttr.unwrap_or(defaults.ttr),
        delay: args.delay,
        priority: args.priority.unwrap_or(defaults.priority),
    };

    let id = queue.push_raw(&args.job, data, options).await?;
    println!("{}", id);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_stats() {
        let stats = QueueStats {
            waiting: 2,
            delayed: 1,
            reserved: 1,
            total: 7,
        };
        assert_eq!(
            format_stats(&stats),
            "Jobs\n- waiting: 2\n- delayed: 1\n- reserved: 1\n- done: 3"
        );
    }

    #[test]
    fn test_parse_exec_id() {
        assert_eq!(parse_exec_id("").unwrap(), None);
        assert_eq!(parse_exec_id("9").unwrap(), Some(MessageId::new(9)));
        assert!(parse_exec_id("x").is_err());
    }

    #[test]
    fn test_push_warns_about_memory_store() {
        let mut config = QueueConfig::default();
        assert!(ephemeral_store_warning(&config).is_some());

        config.store.driver = StoreDriver::Redis;
        assert!(ephemeral_store_warning(&config).is_none());
    }

    #[tokio::test]
    async fn test_clear_requires_confirmation() {
        let queue = Queue::builder().build();
        assert!(clear(&queue, false).await.is_err());
        assert_eq!(clear(&queue, true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_message_fails() {
        let queue = Queue::builder().build();
        assert!(remove(&queue, 0).await.is_err());
        assert!(remove(&queue, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_push_then_run_inline() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("pushed");
        let queue = crate::jobs::register_builtin(Queue::builder()).build();

        let args = PushArgs {
            job: "touch_file".to_string(),
            data: serde_json::json!({ "path": marker }).to_string(),
            ttr: None,
            delay: 0,
            priority: None,
        };
        assert_eq!(push(&queue, &args).await.unwrap(), 0);

        let config = QueueConfig::default();
        let inline = WorkerArgs {
            inline: true,
            max_processes: None,
        };
        assert_eq!(run(queue.clone(), &config, "./config", &inline).await.unwrap(), 0);
        assert!(marker.exists());
    }
}
