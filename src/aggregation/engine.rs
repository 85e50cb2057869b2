use crate::aggregation::metrics::{stats_from_candle, stats_from_totals, PriceMetrics, StatsSource, StatsWindow};
use crate::aggregation::trend::{compute_trend, TrendHorizon};
use crate::config::{AggregationConfig, FeeConfig};
use crate::database::models::{
    CanonicalRecord, Candle, CandleTotals, DirtyMarker, Item, PriceInstant, Side,
    WindowStats,
};
use crate::database::store::{PriceStore, StoreResult};
use crate::error::StageError;
use crate::granularity::Granularity;
use crate::lock::LockManager;
use crate::utils::timing::measure_time;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument};

pub const RECONCILE_LOCK: &str = "reconcile";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub markers: usize,
    pub batches: usize,
    pub records: usize,
    pub failed_batches: usize,
}

/// Everything one batch needs, loaded with a handful of wide queries
#[derive(Debug, Default)]
pub struct BatchInputs {
    pub items: HashMap<i64, Item>,
    pub instants: HashMap<(i64, Side), PriceInstant>,
    /// Most recent row per item for each stats granularity
    pub latest: HashMap<Granularity, HashMap<i64, Candle>>,
    /// Sums keyed by (granularity, span)
    pub totals: HashMap<(Granularity, i64), HashMap<i64, CandleTotals>>,
    /// Most recent priced row per item for each trend source
    pub trend_latest: HashMap<Granularity, HashMap<i64, Candle>>,
    /// Priced rows around every horizon's target, per (source, item)
    pub trend_history: HashMap<(Granularity, i64), Vec<Candle>>,
}

impl BatchInputs {
    pub async fn load(store: &dyn PriceStore, ids: &[i64], now: i64) -> StoreResult<Self> {
        let mut inputs = BatchInputs {
            items: store
                .items_by_id(ids)
                .await?
                .into_iter()
                .map(|item| (item.item_id, item))
                .collect(),
            instants: store
                .price_instants_for(ids)
                .await?
                .into_iter()
                .map(|instant| ((instant.item_id, instant.side), instant))
                .collect(),
            ..Default::default()
        };

        for window in StatsWindow::ALL {
            match window.source() {
                StatsSource::LatestCandle(g) => {
                    if !inputs.latest.contains_key(&g) {
                        inputs.latest.insert(g, store.latest_candles(g, ids, now).await?);
                    }
                }
                StatsSource::Totals { granularity, span_secs } => {
                    let key = (granularity, span_secs);
                    if !inputs.totals.contains_key(&key) {
                        let sums = store.candle_totals(granularity, ids, now - span_secs, now).await?;
                        inputs.totals.insert(key, sums);
                    }
                }
            }
        }

        let sources: BTreeSet<Granularity> = TrendHorizon::ALL.iter().map(|h| h.spec().source).collect();
        for source in sources {
            let latest = store.latest_priced_candles(source, ids, now).await?;

            let mut windows = Vec::new();
            for (&item_id, candle) in &latest {
                for horizon in TrendHorizon::ALL {
                    let spec = horizon.spec();
                    if spec.source != source {
                        continue;
                    }
                    // The extended window contains the strict one
                    windows.push(
                        spec.extended_window(item_id, candle.timestamp)
                            .unwrap_or_else(|| spec.search_window(item_id, candle.timestamp)),
                    );
                }
            }

            for candle in store.priced_candles_in_windows(source, &windows).await? {
                inputs
                    .trend_history
                    .entry((source, candle.item_id))
                    .or_default()
                    .push(candle);
            }
            inputs.trend_latest.insert(source, latest);
        }

        Ok(inputs)
    }

    fn instant(&self, item_id: i64, side: Side) -> Option<&PriceInstant> {
        self.instants.get(&(item_id, side))
    }

    fn window_stats(&self, item_id: i64, window: StatsWindow) -> WindowStats {
        match window.source() {
            StatsSource::LatestCandle(g) => self
                .latest
                .get(&g)
                .and_then(|rows| rows.get(&item_id))
                .map(stats_from_candle)
                .unwrap_or_default(),
            StatsSource::Totals { granularity, span_secs } => self
                .totals
                .get(&(granularity, span_secs))
                .and_then(|rows| rows.get(&item_id))
                .map(stats_from_totals)
                .unwrap_or_default(),
        }
    }

    fn trend(&self, item_id: i64, horizon: TrendHorizon, now: i64) -> Option<f64> {
        let spec = horizon.spec();
        let latest = self.trend_latest.get(&spec.source)?.get(&item_id)?;
        let mut history = self
            .trend_history
            .get(&(spec.source, item_id))
            .cloned()
            .unwrap_or_default();
        history.push(*latest);
        compute_trend(&spec, &history, now)
    }

    /// Recompute every derived field of one item's canonical row
    pub fn build_record(&self, item: &Item, fees: &FeeConfig, now: DateTime<Utc>) -> CanonicalRecord {
        let id = item.item_id;
        let high = self.instant(id, Side::High);
        let low = self.instant(id, Side::Low);
        let metrics = PriceMetrics::compute(
            high.map(|i| i.price),
            low.map(|i| i.price),
            item.buy_limit,
            fees,
        );

        let mut window_stats = [WindowStats::default(); StatsWindow::COUNT];
        for window in StatsWindow::ALL {
            window_stats[window.index()] = self.window_stats(id, window);
        }

        let mut trends = [None; TrendHorizon::COUNT];
        for horizon in TrendHorizon::ALL {
            trends[horizon.index()] = self.trend(id, horizon, now.timestamp());
        }

        CanonicalRecord {
            item_id: id,
            name: item.name.clone(),
            tradeable: item.tradeable,
            buy_limit: item.buy_limit,
            value: item.value,
            high_alch: item.high_alch,
            low_alch: item.low_alch,
            high: high.map(|i| i.price),
            high_time: high.map(|i| i.source_time),
            low: low.map(|i| i.price),
            low_time: low.map(|i| i.source_time),
            margin: metrics.margin,
            roi: metrics.roi,
            spread: metrics.spread,
            max_profit: metrics.max_profit,
            max_investment: metrics.max_investment,
            window_stats,
            trends,
            timestamp_updated: now,
        }
    }
}

/// Load, compute and commit one batch. Markers of items missing from the
/// catalogue are cleared without a record.
async fn process_batch(
    store: &dyn PriceStore,
    fees: &FeeConfig,
    markers: &[DirtyMarker],
    now: DateTime<Utc>,
) -> StoreResult<usize> {
    let ids: Vec<i64> = markers.iter().map(|m| m.item_id).collect();
    let inputs = BatchInputs::load(store, &ids, now.timestamp()).await?;

    let records: Vec<CanonicalRecord> = ids
        .iter()
        .filter_map(|id| inputs.items.get(id))
        .map(|item| inputs.build_record(item, fees, now))
        .collect();

    if records.len() < ids.len() {
        debug!("{} dirty items are not in the catalogue", ids.len() - records.len());
    }

    store.commit_canonical(&records, markers).await?;
    Ok(records.len())
}

pub struct Reconciler {
    store: Arc<dyn PriceStore>,
    locks: LockManager,
    config: AggregationConfig,
    fees: FeeConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PriceStore>, locks: LockManager, config: AggregationConfig, fees: FeeConfig) -> Self {
        Self {
            store,
            locks,
            config,
            fees,
        }
    }

    pub async fn reconcile(&self) -> Result<Option<ReconcileReport>, StageError> {
        self.reconcile_at(Utc::now()).await
    }

    /// Drain up to `max_markers_per_run` markers. Returns `None` when another
    /// process holds the reconcile lock.
    #[instrument(skip(self))]
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<Option<ReconcileReport>, StageError> {
        let Some(_guard) = self.locks.guard(RECONCILE_LOCK)? else {
            info!("Lock '{}' is held, skipping reconcile", RECONCILE_LOCK);
            return Ok(None);
        };

        let markers = self.store.dirty_markers(self.config.max_markers_per_run).await?;
        let mut report = ReconcileReport {
            markers: markers.len(),
            ..Default::default()
        };
        if markers.is_empty() {
            debug!("Dirty queue empty");
            return Ok(Some(report));
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::new();

        for (batch_no, batch) in markers.chunks(self.config.batch_size.max(1)).enumerate() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let store = Arc::clone(&self.store);
            let fees = self.fees.clone();
            let batch = batch.to_vec();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let label = format!("reconcile batch {} ({} items)", batch_no, batch.len());
                (batch_no, measure_time(&label, process_batch(store.as_ref(), &fees, &batch, now)).await)
            }));
        }

        report.batches = handles.len();
        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(records))) => report.records += records,
                Ok((batch_no, Err(e))) => {
                    error!("Reconcile batch {} rolled back: {}", batch_no, e);
                    report.failed_batches += 1;
                }
                Err(e) => {
                    error!("Reconcile batch task failed: {}", e);
                    report.failed_batches += 1;
                }
            }
        }

        info!(
            "Reconciled {} markers in {} batches: {} records written, {} batches failed",
            report.markers, report.batches, report.records, report.failed_batches
        );
        Ok(Some(report))
    }
}
