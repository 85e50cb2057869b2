// src/cli.rs
use crate::aggregation::Reconciler;
use crate::cleanup::RetentionCleaner;
use crate::config::AppConfig;
use crate::database::postgres::PostgresManager;
use crate::database::store::PriceStore;
use crate::error::IngestError;
use crate::granularity::Granularity;
use crate::ingest::{CandleIngestor, IngestOutcome, LatestIngestor};
use crate::lock::LockManager;
use crate::scheduler::boundary::{align_down, target_window};
use crate::upstream::{HttpPriceSource, PriceSource};
use crate::utils::timing::{format_unix, now_secs};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "price-aggregator")]
#[command(about = "Boundary-aligned price ingestion and canonical item aggregation", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler
    Start {
        /// Run in the background and write logs to a file
        #[arg(short, long)]
        detached: bool,
    },

    /// Stop a running scheduler
    Stop,

    /// Show whether the scheduler is running, with held locks and recent logs
    Status,

    /// Create tables, indices and (with TimescaleDB) hypertables
    InitDb,

    /// Ingest a single window now
    Ingest {
        /// latest, 5m, 1h, 6h or 24h
        granularity: Granularity,

        /// Window start (unix seconds). Defaults to the most recent complete window.
        #[arg(short, long)]
        timestamp: Option<i64>,
    },

    /// Ingest every window in a range while holding the granularity's backfill lock
    Backfill {
        /// 5m, 1h, 6h or 24h
        granularity: Granularity,

        /// First window (unix seconds), aligned up to the period
        #[arg(long)]
        from: i64,

        /// Last window (unix seconds), inclusive
        #[arg(long)]
        to: i64,
    },

    /// Drain the dirty-item queue once
    Reconcile,

    /// Prune every table to its retention window once
    Cleanup,

    /// List lock records and whether their holders are alive
    Locks,
}

async fn connect(config: &AppConfig) -> Result<Arc<PostgresManager>> {
    let pg = PostgresManager::new(&config.database).await?;
    Ok(Arc::new(pg))
}

/// Most recent window of `granularity` that has fully closed at `now`
pub fn last_complete_window(granularity: Granularity, now: i64) -> i64 {
    let boundary = align_down(now, granularity.period_secs());
    target_window(boundary, granularity)
}

/// Execute a one-shot command from the CLI
pub async fn execute_command(command: Commands, config: &AppConfig, locks: &LockManager) -> Result<()> {
    match command {
        Commands::InitDb => {
            let pg = connect(config).await?;
            pg.init_tables().await?;
            pg.close().await;
            println!("Database schema is ready.");
        }

        Commands::Ingest { granularity, timestamp } => {
            let pg = connect(config).await?;
            let store: Arc<dyn PriceStore> = pg.clone();
            let source: Arc<dyn PriceSource> = Arc::new(HttpPriceSource::new(&config.upstream)?);

            if granularity == Granularity::Latest {
                if timestamp.is_some() {
                    bail!("the latest feed has no window timestamp");
                }
                match LatestIngestor::new(store, source).ingest().await {
                    Ok(report) => println!(
                        "Applied {} price changes across {} items.",
                        report.changes, report.items
                    ),
                    Err(IngestError::NoChangeDetected) => println!("No price changes since the last snapshot."),
                    Err(e) => return Err(e.into()),
                }
            } else {
                let timestamp = timestamp.unwrap_or_else(|| last_complete_window(granularity, now_secs()));
                let ingestor = CandleIngestor::new(store, source, locks.clone());
                match ingestor.ingest(granularity, timestamp).await? {
                    IngestOutcome::Written { rows } => {
                        println!("Wrote {} {} rows for {}.", rows, granularity, format_unix(timestamp))
                    }
                    IngestOutcome::AlreadyPopulated => {
                        println!("{} window {} is already populated.", granularity, format_unix(timestamp))
                    }
                    IngestOutcome::Skipped(reason) => println!("Skipped: {:?}", reason),
                }
            }
            pg.close().await;
        }

        Commands::Backfill { granularity, from, to } => {
            if !granularity.is_candle() {
                bail!("backfill needs a candle granularity, not '{}'", granularity);
            }
            if from > to {
                bail!("--from {} is after --to {}", from, to);
            }
            let pg = connect(config).await?;
            let source = Arc::new(HttpPriceSource::new(&config.upstream)?);
            let ingestor = CandleIngestor::new(pg.clone(), source, locks.clone());

            match ingestor.backfill(granularity, from, to).await? {
                Some(report) => {
                    println!("Backfill of {} finished:", granularity);
                    println!("  Windows: {}", report.windows);
                    println!("  Written: {}", report.written);
                    println!("  Already populated: {}", report.already_populated);
                    println!("  Failed: {}", report.failed.len());
                    for (window, reason) in &report.failed {
                        println!("    {} - {}", format_unix(*window), reason);
                    }
                }
                None => println!(
                    "Lock '{}' is held by another process; backfill not started.",
                    granularity.backfill_lock()
                ),
            }
            pg.close().await;
        }

        Commands::Reconcile => {
            let pg = connect(config).await?;
            let reconciler = Reconciler::new(
                pg.clone(),
                locks.clone(),
                config.aggregation.clone(),
                config.fees.clone(),
            );
            match reconciler.reconcile().await? {
                Some(report) => println!(
                    "Processed {} markers in {} batches: {} records written, {} batches failed.",
                    report.markers, report.batches, report.records, report.failed_batches
                ),
                None => println!("Aggregation is already running elsewhere."),
            }
            pg.close().await;
        }

        Commands::Cleanup => {
            let pg = connect(config).await?;
            let cleaner = RetentionCleaner::new(pg.clone(), locks.clone(), config.retention.clone());
            match cleaner.cleanup().await? {
                Some(report) => {
                    println!("{:<6} | {:<25} | {:>10}", "Table", "Cutoff", "Deleted");
                    println!("{:-<6}-+-{:-<25}-+-{:->10}", "", "", "");
                    for prune in &report.candles {
                        println!(
                            "{:<6} | {:<25} | {:>10}",
                            prune.granularity.label(),
                            format_unix(prune.cutoff),
                            prune.deleted
                        );
                    }
                    println!("Log entries removed: {}", report.log_deleted);
                    println!("Stale instants removed: {}", report.instants_deleted);
                }
                None => println!("Cleanup is already running elsewhere."),
            }
            pg.close().await;
        }

        Commands::Locks => {
            let records = locks
                .list()
                .with_context(|| format!("Failed to read locks in {}", locks.dir().display()))?;
            if records.is_empty() {
                println!("No locks held in {}.", locks.dir().display());
                return Ok(());
            }
            println!("{:<16} | {:<8} | {:<25} | {:<5}", "Task", "PID", "Started", "Alive");
            println!("{:-<16}-+-{:-<8}-+-{:-<25}-+-{:-<5}", "", "", "", "");
            for (record, alive) in records {
                println!(
                    "{:<16} | {:<8} | {:<25} | {:<5}",
                    record.task,
                    record.pid,
                    record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    if alive { "yes" } else { "no" }
                );
            }
        }

        Commands::Start { .. } | Commands::Stop | Commands::Status => {
            bail!("process commands are handled by the daemon module")
        }
    }

    Ok(())
}
