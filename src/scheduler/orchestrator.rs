// src/scheduler/orchestrator.rs
//
// Boundary-driven scheduling of the feeds and the downstream chain
// (candle feeds -> aggregation -> cleanup). The latest feed has priority:
// a candle boundary waits for the latest tick of the same boundary to
// finish, candle feeds wait on its gate, aggregation waits on every feed
// gate and cleanup excludes aggregation.
//
use crate::aggregation::Reconciler;
use crate::cleanup::RetentionCleaner;
use crate::config::{AppConfig, SchedulerConfig};
use crate::database::store::PriceStore;
use crate::error::IngestError;
use crate::granularity::Granularity;
use crate::ingest::{CandleIngestor, IngestOutcome, LatestIngestor};
use crate::lock::LockManager;
use crate::scheduler::boundary::{
    align_down, is_aligned, next_boundary, target_window, until_boundary,
};
use crate::scheduler::cadence::ReconcileCadence;
use crate::scheduler::gate::StageGates;
use crate::scheduler::retry::{RetryOutcome, RetryPolicy};
use crate::upstream::PriceSource;
use crate::utils::timing::{format_unix, now_secs};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Fetching,
    Succeeded,
    Retrying { attempt: usize },
    GivenUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCause {
    AlreadyRunning,
    LockHeld,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageReport {
    Completed,
    Skipped(SkipCause),
    /// Retryable failures outlasted the attempt budget
    GivenUp { attempts: usize },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryReport {
    pub boundary: i64,
    pub feeds: Vec<(Granularity, StageReport)>,
    pub reconcile: StageReport,
    pub cleanup: StageReport,
}

pub struct Orchestrator {
    config: SchedulerConfig,
    store: Arc<dyn PriceStore>,
    latest: LatestIngestor,
    candles: CandleIngestor,
    reconciler: Reconciler,
    cleaner: RetentionCleaner,
    gates: StageGates,
    states: Mutex<HashMap<Granularity, FeedState>>,
    last_latest_success: Mutex<Option<i64>>,
    /// Newest boundary no latest tick will run for any more
    latest_finished: watch::Sender<i64>,
    retry: RetryPolicy,
    cadence: ReconcileCadence,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn PriceStore>,
        source: Arc<dyn PriceSource>,
        locks: LockManager,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config: config.scheduler.clone(),
            latest: LatestIngestor::new(Arc::clone(&store), Arc::clone(&source)),
            candles: CandleIngestor::new(Arc::clone(&store), source, locks.clone()),
            reconciler: Reconciler::new(
                Arc::clone(&store),
                locks.clone(),
                config.aggregation.clone(),
                config.fees.clone(),
            ),
            cleaner: RetentionCleaner::new(Arc::clone(&store), locks, config.retention.clone()),
            store,
            gates: StageGates::new(),
            states: Mutex::new(HashMap::new()),
            last_latest_success: Mutex::new(None),
            latest_finished: watch::channel(i64::MIN).0,
            retry: RetryPolicy::new(config.scheduler.retry_delay()),
            cadence: ReconcileCadence::from_config(&config.aggregation),
            shutdown,
        }
    }

    pub fn gates(&self) -> &StageGates {
        &self.gates
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn feed_state(&self, granularity: Granularity) -> FeedState {
        self.states
            .lock()
            .get(&granularity)
            .copied()
            .unwrap_or(FeedState::Idle)
    }

    pub fn last_latest_success(&self) -> Option<i64> {
        *self.last_latest_success.lock()
    }

    fn set_state(&self, granularity: Granularity, state: FeedState) {
        let previous = self.states.lock().insert(granularity, state);
        if previous == Some(state) {
            return;
        }
        match state {
            FeedState::GivenUp => error!("Feed {} gave up", granularity),
            FeedState::Retrying { attempt } => warn!("Feed {} retrying after attempt {}", granularity, attempt),
            _ => debug!("Feed {} -> {:?}", granularity, state),
        }
    }

    /// Run the three scheduling loops until shutdown is requested
    pub async fn run(self: Arc<Self>) {
        info!(
            "Scheduler started: latest every {}s, candles every {}s",
            self.config.latest_period_secs, self.config.candle_period_secs
        );

        let loops = [
            ("latest", tokio::spawn(Arc::clone(&self).latest_loop())),
            ("candles", tokio::spawn(Arc::clone(&self).candle_loop())),
            ("reconcile", tokio::spawn(Arc::clone(&self).reconcile_loop())),
        ];
        for (name, handle) in loops {
            if let Err(e) = handle.await {
                error!("{} loop terminated abnormally: {}", name, e);
            }
        }
        info!("Scheduler stopped");
    }

    /// Sleep until `boundary`. Returns false when shutdown came first.
    async fn sleep_until(&self, boundary: i64) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(until_boundary(boundary)) => !self.shutdown.is_cancelled(),
        }
    }

    async fn latest_loop(self: Arc<Self>) {
        loop {
            let now = now_secs();
            let base = self.last_latest_success().map_or(now, |last| last.max(now));
            let boundary = next_boundary(base, self.config.latest_period_secs);
            if !self.sleep_until(boundary).await {
                break;
            }

            let this = Arc::clone(&self);
            if let Err(e) = tokio::spawn(async move { this.run_latest_at(boundary).await }).await {
                error!("Latest tick at {} panicked: {}", format_unix(boundary), e);
                self.mark_latest_finished(boundary);
            }
        }
        debug!("Latest loop stopped");
    }

    async fn candle_loop(self: Arc<Self>) {
        loop {
            let boundary = next_boundary(now_secs(), self.config.candle_period_secs);
            if !self.sleep_until(boundary).await {
                break;
            }

            let this = Arc::clone(&self);
            match tokio::spawn(async move { this.run_candle_boundary(boundary).await }).await {
                Ok(report) => debug!("Boundary {} finished: {:?}", format_unix(boundary), report),
                Err(e) => error!("Boundary {} chain panicked: {}", format_unix(boundary), e),
            }
        }
        debug!("Candle loop stopped");
    }

    async fn reconcile_loop(self: Arc<Self>) {
        loop {
            let depth = match self.store.dirty_count().await {
                Ok(depth) => depth,
                Err(e) => {
                    warn!("Could not read dirty queue depth: {}", e);
                    0
                }
            };
            let interval = self.cadence.interval_for(depth);
            debug!("Dirty queue depth {}, next reconcile in {:?}", depth, interval);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let this = Arc::clone(&self);
            if let Err(e) = tokio::spawn(async move { this.run_reconcile().await }).await {
                error!("Reconcile run panicked: {}", e);
            }
        }
        debug!("Reconcile loop stopped");
    }

    fn settle<T>(&self, granularity: Granularity, outcome: RetryOutcome<T, IngestError>) -> StageReport {
        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                self.set_state(granularity, FeedState::Succeeded);
                info!("Feed {} succeeded after {} attempt(s)", granularity, attempts);
                StageReport::Completed
            }
            // A quiet market is a legitimate outcome once the budget is spent
            RetryOutcome::Exhausted {
                error: IngestError::NoChangeDetected,
                attempts,
            } => {
                self.set_state(granularity, FeedState::Succeeded);
                info!("Feed {} saw no changes in {} attempts", granularity, attempts);
                StageReport::Completed
            }
            RetryOutcome::Exhausted { error, attempts } => {
                self.set_state(granularity, FeedState::GivenUp);
                error!(
                    "Feed {} abandoned this boundary after {} attempts: {}",
                    granularity, attempts, error
                );
                StageReport::GivenUp { attempts }
            }
            RetryOutcome::Failed { error, .. } => {
                self.set_state(granularity, FeedState::GivenUp);
                error!("Feed {} failed: {}", granularity, error);
                StageReport::Failed(error.to_string())
            }
            RetryOutcome::Cancelled { .. } => {
                self.set_state(granularity, FeedState::Idle);
                StageReport::Skipped(SkipCause::ShuttingDown)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn run_latest_tick(&self) -> StageReport {
        if self.shutdown.is_cancelled() {
            return StageReport::Skipped(SkipCause::ShuttingDown);
        }
        let Some(_running) = self.gates.latest.try_enter() else {
            info!("Latest feed still running, skipping this tick");
            return StageReport::Skipped(SkipCause::AlreadyRunning);
        };

        let retry_attempts = self.config.retry_attempts;
        let no_change_attempts = self.config.no_change_attempts;
        let outcome = self
            .retry
            .run(
                "latest feed",
                &self.shutdown,
                |e: &IngestError| match e {
                    IngestError::NoChangeDetected => no_change_attempts,
                    e if e.is_retryable() => retry_attempts,
                    _ => 0,
                },
                |attempt| async move {
                    self.set_state(Granularity::Latest, FeedState::Fetching);
                    let result = self.latest.ingest().await;
                    if matches!(&result, Err(e) if e.is_retryable()) {
                        self.set_state(Granularity::Latest, FeedState::Retrying { attempt });
                    }
                    result
                },
            )
            .await;

        let report = self.settle(Granularity::Latest, outcome);
        if report == StageReport::Completed {
            *self.last_latest_success.lock() = Some(now_secs());
        }
        report
    }

    /// Latest tick owning `boundary`. Whatever its outcome, candle work for
    /// the boundary is released once it returns.
    pub async fn run_latest_at(&self, boundary: i64) -> StageReport {
        let report = self.run_latest_tick().await;
        self.mark_latest_finished(boundary);
        report
    }

    fn mark_latest_finished(&self, boundary: i64) {
        // Boundaries already behind the clock are never ticked again
        let settled = align_down(now_secs(), self.config.latest_period_secs).max(boundary);
        self.latest_finished.send_if_modified(|finished| {
            if settled > *finished {
                *finished = settled;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the latest tick for `boundary` is over. False on shutdown.
    async fn wait_for_latest(&self, boundary: i64) -> bool {
        let mut finished = self.latest_finished.subscribe();
        if *finished.borrow() < boundary {
            debug!("Boundary {} waiting for its latest tick", format_unix(boundary));
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            done = async { finished.wait_for(|last| *last >= boundary).await.is_ok() } => done,
        }
    }

    /// One candle window, waiting for the latest feed and retrying transient failures
    #[instrument(skip(self), fields(window = %format_unix(timestamp)))]
    pub async fn run_feed(&self, granularity: Granularity, timestamp: i64) -> StageReport {
        if self.shutdown.is_cancelled() {
            return StageReport::Skipped(SkipCause::ShuttingDown);
        }

        if self.gates.latest.is_running() {
            info!("Feed {} waiting for the latest feed", granularity);
        }
        self.gates.latest.wait_idle().await;

        let Some(_running) = self.gates.feed(granularity).try_enter() else {
            info!("Feed {} already running, skipping", granularity);
            return StageReport::Skipped(SkipCause::AlreadyRunning);
        };

        let retry_attempts = self.config.retry_attempts;
        let outcome = self
            .retry
            .run(
                &format!("{} feed", granularity),
                &self.shutdown,
                |e: &IngestError| if e.is_retryable() { retry_attempts } else { 0 },
                |attempt| async move {
                    self.gates.latest.wait_idle().await;
                    self.set_state(granularity, FeedState::Fetching);
                    let result = self.candles.ingest(granularity, timestamp).await;
                    if matches!(&result, Err(e) if e.is_retryable()) {
                        self.set_state(granularity, FeedState::Retrying { attempt });
                    }
                    result
                },
            )
            .await;

        if let RetryOutcome::Succeeded {
            value: IngestOutcome::Skipped(_),
            ..
        } = outcome
        {
            self.set_state(granularity, FeedState::Idle);
            return StageReport::Skipped(SkipCause::LockHeld);
        }
        self.settle(granularity, outcome)
    }

    /// After the boundary's latest tick: the fastest feed, every coarser feed
    /// due at this boundary, then aggregation and cleanup. Feeds that give up
    /// do not stop the chain.
    #[instrument(skip(self), fields(at = %format_unix(boundary)))]
    pub async fn run_candle_boundary(&self, boundary: i64) -> BoundaryReport {
        if !self.wait_for_latest(boundary).await {
            let skipped = StageReport::Skipped(SkipCause::ShuttingDown);
            return BoundaryReport {
                boundary,
                feeds: Vec::new(),
                reconcile: skipped.clone(),
                cleanup: skipped,
            };
        }

        let mut feeds = Vec::new();
        for granularity in Granularity::CANDLES {
            if !is_aligned(boundary, granularity.period_secs()) {
                continue;
            }
            let report = self
                .run_feed(granularity, target_window(boundary, granularity))
                .await;
            feeds.push((granularity, report));
        }

        let reconcile = self.run_reconcile().await;
        let cleanup = self.run_cleanup().await;

        BoundaryReport {
            boundary,
            feeds,
            reconcile,
            cleanup,
        }
    }

    pub async fn run_reconcile(&self) -> StageReport {
        if self.shutdown.is_cancelled() {
            return StageReport::Skipped(SkipCause::ShuttingDown);
        }
        self.gates.wait_feeds_idle().await;

        let Some(_running) = self.gates.aggregation.try_enter() else {
            debug!("Aggregation already running");
            return StageReport::Skipped(SkipCause::AlreadyRunning);
        };

        match self.reconciler.reconcile().await {
            Ok(Some(report)) if report.failed_batches > 0 => StageReport::Failed(format!(
                "{} of {} batches failed",
                report.failed_batches, report.batches
            )),
            Ok(Some(_)) => StageReport::Completed,
            Ok(None) => StageReport::Skipped(SkipCause::LockHeld),
            Err(e) => {
                error!("Reconcile failed: {}", e);
                StageReport::Failed(e.to_string())
            }
        }
    }

    pub async fn run_cleanup(&self) -> StageReport {
        if self.shutdown.is_cancelled() {
            return StageReport::Skipped(SkipCause::ShuttingDown);
        }

        // Holding the aggregation gate keeps reconcile out while rows are deleted
        let _aggregation = self.gates.aggregation.enter().await;
        let Some(_running) = self.gates.cleanup.try_enter() else {
            debug!("Cleanup already running");
            return StageReport::Skipped(SkipCause::AlreadyRunning);
        };

        match self.cleaner.cleanup().await {
            Ok(Some(_)) => StageReport::Completed,
            Ok(None) => StageReport::Skipped(SkipCause::LockHeld),
            Err(e) => {
                error!("Cleanup failed: {}", e);
                StageReport::Failed(e.to_string())
            }
        }
    }

    /// Wait up to `grace` for in-flight stages to leave their gates
    pub async fn drain(&self, grace: Duration) -> bool {
        let idle = async {
            self.gates.wait_feeds_idle().await;
            self.gates.aggregation.wait_idle().await;
            self.gates.cleanup.wait_idle().await;
        };
        tokio::time::timeout(grace, idle).await.is_ok()
    }
}
