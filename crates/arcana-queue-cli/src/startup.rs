//! Process startup: logging, queue assembly and shutdown signals.

use crate::jobs::register_builtin;
use arcana_queue::{store, CommandLauncher, JobError, JobResult, LogHook, MetricsHook, Queue, QueueBuilder};
use arcana_queue_config::{LoggingConfig, QueueConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Default filter when `RUST_LOG` is not set.
pub fn default_filter(logging: &LoggingConfig) -> String {
    format!("{},arcana_queue=debug", logging.level)
}

/// Installs the global tracing subscriber. Logs go to stderr so stdout stays
/// free for job output.
pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(logging)));

    let json = logging.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text = (!logging.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

/// Builds the queue described by `config`, with the built-in jobs and the log
/// and metrics hooks registered.
pub async fn build_queue(config: &QueueConfig) -> JobResult<Queue> {
    arcana_queue::register_metrics();
    let store = store::connect(config).await?;

    let builder = QueueBuilder::from_config(config)
        .store(store)
        .hook(Arc::new(LogHook))
        .hook(Arc::new(MetricsHook));
    Ok(register_builtin(builder).build())
}

/// Launcher that re-enters this binary (or `worker.program`) with `exec`.
pub fn launcher(config: &QueueConfig, config_dir: &str) -> JobResult<CommandLauncher> {
    let launcher = match &config.worker.program {
        Some(program) => CommandLauncher::new(program),
        None => CommandLauncher::new(std::env::current_exe().map_err(|e| {
            JobError::Configuration(format!("Cannot resolve current executable: {}", e))
        })?),
    };
    Ok(launcher.arg("--config").arg(config_dir).arg("exec"))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}

/// Watch channel flipped to `true` once a shutdown signal arrives.
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_uses_configured_level() {
        let logging = LoggingConfig {
            level: "warn".to_string(),
            json: false,
        };
        assert_eq!(default_filter(&logging), "warn,arcana_queue=debug");
    }

    #[tokio::test]
    async fn test_build_queue_registers_builtins() {
        let queue = build_queue(&QueueConfig::default()).await.unwrap();
        assert!(queue.registry().contains("touch_file"));
        assert_eq!(queue.hooks().len(), 2);
    }

    #[test]
    fn test_launcher_prefers_configured_program() {
        let mut config = QueueConfig::default();
        config.worker.program = Some("/usr/local/bin/worker".to_string());

        let launcher = launcher(&config, "/etc/queue").unwrap();
        assert_eq!(launcher.program().to_string_lossy(), "/usr/local/bin/worker");
    }
}
