use crate::database::models::Candle;
use crate::database::store::PriceStore;
use crate::error::{FetchError, IngestError};
use crate::granularity::Granularity;
use crate::lock::LockManager;
use crate::upstream::PriceSource;
use crate::utils::timing::{format_unix, measure_time};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A manual backfill owns this granularity's table
    BackfillLockHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Written { rows: u64 },
    /// Every known item already has a row for the window
    AlreadyPopulated,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub windows: usize,
    pub written: usize,
    pub already_populated: usize,
    /// Windows whose fetch failed, with the error text
    pub failed: Vec<(i64, String)>,
}

pub struct CandleIngestor {
    store: Arc<dyn PriceStore>,
    source: Arc<dyn PriceSource>,
    locks: LockManager,
}

impl CandleIngestor {
    pub fn new(store: Arc<dyn PriceStore>, source: Arc<dyn PriceSource>, locks: LockManager) -> Self {
        Self { store, source, locks }
    }

    /// Scheduled ingestion of one window; yields to a running backfill
    #[instrument(skip(self), fields(window = %format_unix(timestamp)))]
    pub async fn ingest(&self, granularity: Granularity, timestamp: i64) -> Result<IngestOutcome, IngestError> {
        let lock = granularity.backfill_lock();
        if self.locks.is_held(&lock)? {
            info!("Lock '{}' is held, skipping {} ingestion", lock, granularity);
            return Ok(IngestOutcome::Skipped(SkipReason::BackfillLockHeld));
        }
        self.ingest_window(granularity, timestamp).await
    }

    /// Ingest one window without consulting the backfill lock
    pub async fn ingest_window(
        &self,
        granularity: Granularity,
        timestamp: i64,
    ) -> Result<IngestOutcome, IngestError> {
        let items = self.store.items().await?;

        let populated = self.store.window_row_count(granularity, timestamp).await?;
        if populated >= items.len() {
            debug!(
                "{} window {} already populated ({} rows)",
                granularity, timestamp, populated
            );
            return Ok(IngestOutcome::AlreadyPopulated);
        }

        let snapshot = self.source.fetch_window(granularity, timestamp).await?;
        if snapshot.timestamp != Some(timestamp) {
            return Err(FetchError::WindowMismatch {
                requested: timestamp,
                served: snapshot.timestamp,
            }
            .into());
        }
        if snapshot.quotes.is_empty() {
            return Err(FetchError::EmptySnapshot(granularity.label().to_string()).into());
        }

        // Items missing from the response still get a row: checked, no trades
        let candles: Vec<Candle> = items
            .iter()
            .map(|item| match snapshot.quotes.get(&item.item_id) {
                Some(quote) => quote.to_candle(item.item_id, timestamp),
                None => Candle::empty(item.item_id, timestamp),
            })
            .collect();

        let known: HashSet<i64> = items.iter().map(|item| item.item_id).collect();
        let unknown = snapshot.quotes.keys().filter(|id| !known.contains(id)).count();
        if unknown > 0 {
            debug!("Ignoring {} quotes for items missing from the catalogue", unknown);
        }

        let rows = measure_time(
            &format!("{} upsert of {} candles", granularity, candles.len()),
            self.store.upsert_candles(granularity, &candles),
        )
        .await?;

        info!(
            "Stored {} window {}: {} of {} rows written, {} items traded",
            granularity,
            format_unix(timestamp),
            rows,
            candles.len(),
            snapshot.quotes.len() - unknown
        );
        Ok(IngestOutcome::Written { rows })
    }

    /// Walk every window in `[from, to]` while holding the backfill lock.
    /// Returns `None` when another process already runs a backfill.
    #[instrument(skip(self))]
    pub async fn backfill(
        &self,
        granularity: Granularity,
        from: i64,
        to: i64,
    ) -> Result<Option<BackfillReport>, IngestError> {
        let lock = granularity.backfill_lock();
        let Some(_guard) = self.locks.guard(&lock)? else {
            info!("Lock '{}' is held by another process, not starting backfill", lock);
            return Ok(None);
        };

        let period = granularity.period_secs();
        let first = from.div_euclid(period) * period + if from.rem_euclid(period) == 0 { 0 } else { period };

        let mut report = BackfillReport::default();
        let mut window = first;
        while window <= to {
            report.windows += 1;
            match self.ingest_window(granularity, window).await {
                Ok(IngestOutcome::Written { .. }) => report.written += 1,
                Ok(IngestOutcome::AlreadyPopulated) => report.already_populated += 1,
                Ok(IngestOutcome::Skipped(_)) => {}
                Err(e) if e.is_retryable() => {
                    warn!("Backfill of {} window {} failed: {}", granularity, window, e);
                    report.failed.push((window, e.to_string()));
                }
                Err(e) => return Err(e),
            }
            window += period;
        }

        info!(
            "Backfill of {} finished: {} windows, {} written, {} already populated, {} failed",
            granularity,
            report.windows,
            report.written,
            report.already_populated,
            report.failed.len()
        );
        Ok(Some(report))
    }
}
