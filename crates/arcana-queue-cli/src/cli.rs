//! Command-line definition.

use clap::{Args, Parser, Subcommand};

/// Arcana Queue - job queue worker and administration tool
#[derive(Debug, Parser)]
#[command(
    name = "arcana-queue",
    version,
    about = "Arcana Queue - job queue worker and administration tool",
    propagate_version = true
)]
pub struct Cli {
    /// Configuration directory
    #[arg(long, global = true, env = "ARCANA_QUEUE_CONFIG_DIR", default_value = "./config")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print queue counts
    Info,

    /// Process every waiting message, then exit
    Run(WorkerArgs),

    /// Process messages as they arrive until interrupted
    Listen {
        /// Seconds to block on each reservation (at least 1)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,

        #[command(flatten)]
        worker: WorkerArgs,
    },

    /// Execute one message read from stdin (used by isolated workers)
    Exec(ExecArgs),

    /// Remove every waiting and delayed message
    Clear {
        /// Confirm clearing the queue
        #[arg(long)]
        yes: bool,
    },

    /// Remove one message
    Remove {
        /// Message id
        id: u64,
    },

    /// Push a built-in job
    Push(PushArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct WorkerArgs {
    /// Execute jobs in this process instead of worker processes
    #[arg(long)]
    pub inline: bool,

    /// Maximum concurrent worker processes
    #[arg(long)]
    pub max_processes: Option<usize>,
}

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    /// Message id, empty when unknown
    #[arg(long, default_value = "")]
    pub id: String,

    /// Time to reserve in seconds
    #[arg(long)]
    pub ttr: u32,

    /// Attempt number
    #[arg(long)]
    pub attempt: u32,

    /// PID of the parent worker, 0 when unknown
    #[arg(long, default_value_t = 0)]
    pub pid: u32,
}

#[derive(Debug, Clone, Args)]
pub struct PushArgs {
    /// Job name (touch_file, sleep, echo, flaky)
    pub job: String,

    /// Job data as JSON
    #[arg(default_value = "{}")]
    pub data: String,

    /// Time to reserve in seconds
    #[arg(long)]
    pub ttr: Option<u32>,

    /// Delay in seconds
    #[arg(long, default_value_t = 0)]
    pub delay: u32,

    /// Priority, lower runs first
    #[arg(long)]
    pub priority: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_accepts_empty_id() {
        let cli = Cli::try_parse_from([
            "arcana-queue",
            "exec",
            "--id=",
            "--ttr=30",
            "--attempt=2",
            "--pid=10",
        ])
        .unwrap();

        match cli.command {
            Commands::Exec(args) => {
                assert_eq!(args.id, "");
                assert_eq!(args.ttr, 30);
                assert_eq!(args.attempt, 2);
                assert_eq!(args.pid, 10);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_listen_timeout_must_be_positive() {
        assert!(Cli::try_parse_from(["arcana-queue", "listen", "--timeout", "0"]).is_err());

        let cli = Cli::try_parse_from(["arcana-queue", "listen", "--timeout", "5", "--inline"])
            .unwrap();
        match cli.command {
            Commands::Listen { timeout, worker } => {
                assert_eq!(timeout, Some(5));
                assert!(worker.inline);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["arcana-queue", "info", "--config", "/etc/queue"]).unwrap();
        assert_eq!(cli.config, "/etc/queue");
    }
}
