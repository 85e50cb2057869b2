// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use price_aggregator::cli::{execute_command, Cli, Commands};
use price_aggregator::config::AppConfig;
use price_aggregator::daemon::{check_daemon_status, run_scheduler, start_daemon, stop_daemon};
use price_aggregator::lock::LockManager;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse command line arguments
    let cli = Cli::parse();

    let config = AppConfig::load()?;
    let locks = LockManager::new(&config.locks.dir)
        .with_context(|| format!("Failed to open lock directory {}", config.locks.dir.display()))?;

    match cli.command {
        Commands::Start { detached } => {
            if detached {
                start_daemon(&locks).await?;
            } else {
                run_scheduler(config, locks).await?;
            }
        }
        Commands::Stop => {
            let grace = Duration::from_secs(config.scheduler.shutdown_grace_secs);
            stop_daemon(&locks, grace).await?;
        }
        Commands::Status => {
            check_daemon_status(&locks).await?;
        }
        command => {
            execute_command(command, &config, &locks).await?;
        }
    }

    Ok(())
}
