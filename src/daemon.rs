// src/daemon.rs
use crate::config::AppConfig;
use crate::database::postgres::PostgresManager;
use crate::database::store::PriceStore;
use crate::lock::{process_alive, LockManager};
use crate::scheduler::Orchestrator;
use crate::upstream::HttpPriceSource;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Held for the lifetime of the scheduler; its pid identifies the daemon
pub const SCHEDULER_LOCK: &str = "scheduler";

const LOG_FILE: &str = "/tmp/price-aggregator.log";
const STATUS_LOG_LINES: usize = 10;

/// Start the scheduler as a background process
pub async fn start_daemon(locks: &LockManager) -> Result<()> {
    if let Some(holder) = locks.holder(SCHEDULER_LOCK)? {
        println!("Price aggregator is already running (PID {}).", holder.pid);
        return Ok(());
    }

    let exec_path = std::env::current_exe()?;
    let log_file = File::create(LOG_FILE).with_context(|| format!("Failed to create {}", LOG_FILE))?;

    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("nohup");
        cmd.arg(exec_path);
        cmd
    };
    #[cfg(not(unix))]
    let mut cmd = Command::new(exec_path);

    cmd.arg("start")
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file))
        .stdin(Stdio::null());
    if std::env::var_os("RUST_LOG").is_none() {
        cmd.env("RUST_LOG", "info");
    }
    let child = cmd.spawn().context("Failed to spawn the scheduler process")?;

    // The child publishes its pid through the scheduler lock once it is up
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Some(holder) = locks.holder(SCHEDULER_LOCK)? {
            println!("Price aggregator daemon started with PID {}.", holder.pid);
            println!("Logs are being written to {}", LOG_FILE);
            return Ok(());
        }
    }

    println!(
        "Daemon spawned (launcher PID {}) but has not taken the '{}' lock yet. Check {}.",
        child.id(),
        SCHEDULER_LOCK,
        LOG_FILE
    );
    Ok(())
}

/// Stop the scheduler: SIGTERM first, SIGKILL once `grace` has passed
pub async fn stop_daemon(locks: &LockManager, grace: Duration) -> Result<()> {
    let Some(holder) = locks.holder(SCHEDULER_LOCK)? else {
        println!("Price aggregator is not running.");
        return Ok(());
    };
    let pid = holder.pid;

    terminate(pid).with_context(|| format!("Failed to terminate process with PID {}", pid))?;
    println!("Sent termination signal to price aggregator daemon (PID {}).", pid);

    let deadline = tokio::time::Instant::now() + grace;
    while process_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if process_alive(pid) {
        println!("Process still running after {:?}, attempting force kill...", grace);
        force_kill(pid).with_context(|| format!("Failed to kill process with PID {}", pid))?;
        println!("Force killed price aggregator daemon (PID {}).", pid);
    }

    // A killed process leaves its record behind; the liveness check clears it
    if locks.holder(SCHEDULER_LOCK)?.is_some() {
        warn!("Lock '{}' still reports a live holder", SCHEDULER_LOCK);
    }
    println!("Price aggregator daemon stopped.");
    Ok(())
}

/// Print daemon status, held locks and the tail of the log file
pub async fn check_daemon_status(locks: &LockManager) -> Result<()> {
    match locks.holder(SCHEDULER_LOCK)? {
        Some(holder) => {
            let uptime = Utc::now() - holder.started_at;
            println!("Price aggregator is running (PID {}).", holder.pid);
            println!("Started: {}", holder.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!(
                "Uptime: {}h {}m {}s",
                uptime.num_hours(),
                uptime.num_minutes() % 60,
                uptime.num_seconds() % 60
            );
        }
        None => println!("Price aggregator is not running."),
    }

    let records = locks.list()?;
    let others: Vec<_> = records.iter().filter(|(r, _)| r.task != SCHEDULER_LOCK).collect();
    if !others.is_empty() {
        println!("\nHeld locks:");
        for (record, alive) in others {
            println!(
                "  {} (PID {}, since {}){}",
                record.task,
                record.pid,
                record.started_at.format("%H:%M:%S"),
                if *alive { "" } else { " [stale]" }
            );
        }
    }

    if let Some(lines) = tail_lines(Path::new(LOG_FILE), STATUS_LOG_LINES) {
        println!("\nRecent logs:");
        for line in lines {
            println!("{}", line);
        }
    }
    Ok(())
}

fn tail_lines(path: &Path, count: usize) -> Option<Vec<String>> {
    let body = fs::read_to_string(path).ok()?;
    let lines: Vec<String> = body.lines().map(str::to_string).collect();
    let skip = lines.len().saturating_sub(count);
    Some(lines.into_iter().skip(skip).collect())
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> std::io::Result<()> {
    send_signal(pid, libc::SIGTERM)
}

#[cfg(unix)]
fn force_kill(pid: u32) -> std::io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> std::io::Result<()> {
    force_kill(pid)
}

#[cfg(not(unix))]
fn force_kill(pid: u32) -> std::io::Result<()> {
    let status = Command::new("taskkill")
        .arg("/PID")
        .arg(pid.to_string())
        .arg("/F")
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "taskkill failed"))
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
pub async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received terminate signal, shutting down..."),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

/// Run the scheduler in the foreground until a signal arrives
pub async fn run_scheduler(config: AppConfig, locks: LockManager) -> Result<()> {
    let Some(_scheduler) = locks.guard(SCHEDULER_LOCK)? else {
        let pid = locks.holder(SCHEDULER_LOCK)?.map(|h| h.pid);
        bail!("another scheduler is already running (PID {:?})", pid);
    };

    let pg = Arc::new(PostgresManager::new(&config.database).await?);
    pg.init_tables().await?;
    let store: Arc<dyn PriceStore> = pg.clone();
    let source = Arc::new(HttpPriceSource::new(&config.upstream)?);

    let shutdown = CancellationToken::new();
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        store,
        source,
        locks.clone(),
        shutdown.clone(),
    ));

    tokio::spawn(watch_signals(shutdown.clone()));
    let mut runner = tokio::spawn(Arc::clone(&orchestrator).run());

    let mut finished = false;
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = &mut runner => {
            finished = true;
            if let Err(e) = result {
                error!("Scheduler task failed: {}", e);
            }
            shutdown.cancel();
        }
    }

    let grace = Duration::from_secs(config.scheduler.shutdown_grace_secs);
    info!("Draining running stages (grace {:?})", grace);
    if !orchestrator.drain(grace).await {
        warn!("Stages were still running when the grace period ended");
    }
    if !finished {
        match tokio::time::timeout(grace, runner).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Scheduler task failed: {}", e),
            Err(_) => warn!("Scheduler loops did not stop within {:?}", grace),
        }
    }

    pg.close().await;
    let released = locks.release_owned()?;
    info!("Shutdown complete, released {} locks", released);
    Ok(())
}
