//! Retention pruning. Cutoffs are anchored to the newest stored row of each
//! table, so a pipeline that fell behind keeps everything still inside its
//! logical window.
use crate::config::RetentionConfig;
use crate::database::store::PriceStore;
use crate::error::StageError;
use crate::granularity::Granularity;
use crate::lock::LockManager;
use crate::scheduler::boundary::align_down;
use crate::utils::timing::format_unix;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const CLEANUP_LOCK: &str = "cleanup";

/// Oldest timestamp kept for a candle table whose newest row is `latest`.
/// Aligned down to the interval, then moved back one more interval.
pub fn retention_cutoff(latest: i64, granularity: Granularity) -> i64 {
    let interval = granularity.period_secs();
    let raw = latest - (granularity.retention_secs() + granularity.buffer_secs());
    align_down(raw, interval) - interval
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TablePrune {
    pub granularity: Granularity,
    pub cutoff: i64,
    pub deleted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub candles: Vec<TablePrune>,
    pub log_deleted: u64,
    pub instants_deleted: u64,
}

pub struct RetentionCleaner {
    store: Arc<dyn PriceStore>,
    locks: LockManager,
    config: RetentionConfig,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn PriceStore>, locks: LockManager, config: RetentionConfig) -> Self {
        Self { store, locks, config }
    }

    /// Returns `None` when another process holds the cleanup lock
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<Option<CleanupReport>, StageError> {
        let Some(_guard) = self.locks.guard(CLEANUP_LOCK)? else {
            info!("Lock '{}' is held, skipping cleanup", CLEANUP_LOCK);
            return Ok(None);
        };

        let mut report = CleanupReport::default();

        for granularity in Granularity::CANDLES {
            let Some(latest) = self.store.latest_candle_timestamp(granularity).await? else {
                debug!("{} table is empty, nothing to prune", granularity);
                continue;
            };
            let cutoff = retention_cutoff(latest, granularity);
            let deleted = self.store.delete_candles_before(granularity, cutoff).await?;
            if deleted > 0 {
                info!(
                    "Pruned {} {} rows older than {}",
                    deleted,
                    granularity,
                    format_unix(cutoff)
                );
            }
            report.candles.push(TablePrune {
                granularity,
                cutoff,
                deleted,
            });
        }

        let keep = self.config.keep_recent;
        if let Some(newest) = self.store.latest_log_observed_at().await? {
            let cutoff = newest - Duration::seconds(self.config.log_retention_secs);
            report.log_deleted = self.store.prune_price_log(cutoff, keep).await?;
        }
        if let Some(newest) = self.store.latest_instant_update().await? {
            let cutoff = newest - Duration::seconds(self.config.instant_retention_secs);
            report.instants_deleted = self.store.prune_price_instants(cutoff, keep).await?;
        }

        info!(
            "Cleanup finished: {} candle rows, {} log entries, {} stale instants removed",
            report.candles.iter().map(|t| t.deleted).sum::<u64>(),
            report.log_deleted,
            report.instants_deleted
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_minute_cutoff_keeps_a_full_day_plus_buffer() {
        let latest = 1_700_006_400;
        let cutoff = retention_cutoff(latest, Granularity::FiveMinutes);
        // 24h + 5m retention, 5m buffer, one extra interval
        assert_eq!(latest - cutoff, 86_400 + 300 + 300 + 300);
        assert_eq!(cutoff % 300, 0);
    }

    #[test]
    fn unaligned_latest_is_aligned_down_first() {
        let cutoff = retention_cutoff(7 * 86_400 + 3_600 * 3 + 17, Granularity::OneHour);
        assert_eq!(cutoff % 3_600, 0);
        // 615_617 - 612_000 = 3_617, aligned to 3_600, minus one hour
        assert_eq!(cutoff, 0);
    }

    #[test]
    fn latest_row_is_never_before_its_own_cutoff() {
        for g in Granularity::CANDLES {
            for latest in [0, 1, g.period_secs(), 1_700_000_000] {
                assert!(retention_cutoff(latest, g) < latest);
            }
        }
    }
}
