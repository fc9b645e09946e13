//! # Arcana Queue
//!
//! Entry point for the `arcana-queue` binary.
//!
//! Subcommands:
//! - **run** / **listen**: worker loops, inline or with isolated worker processes
//! - **exec**: runs one message read from stdin; the exit code reports the outcome
//! - **info**, **push**, **remove**, **clear**: queue administration

use arcana_queue_cli::cli::Cli;
use arcana_queue_cli::{commands, startup};
use arcana_queue_config::ConfigLoader;
use clap::Parser;
use tracing::{debug, error};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ConfigLoader::new(cli.config.as_str()) {
        Ok(loader) => loader.get().await,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    startup::init_logging(&config.logging);
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.app.environment,
        store = %config.store.driver,
        "Arcana Queue starting"
    );

    match commands::execute(cli.command, &config, &cli.config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
