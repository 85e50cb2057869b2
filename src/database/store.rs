use crate::database::models::{
    CanonicalRecord, Candle, CandleTotals, CandleWindow, DirtyMarker, Item, PriceChange,
    PriceInstant,
};
use crate::error::StoreError;
use crate::granularity::Granularity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the ingestors, the reconciler and the cleaner read or write.
/// Methods that touch more than one row run inside a single transaction.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// All known items
    async fn items(&self) -> StoreResult<Vec<Item>>;

    async fn items_by_id(&self, ids: &[i64]) -> StoreResult<Vec<Item>>;

    // ---- latest feed ----

    async fn price_instants(&self) -> StoreResult<Vec<PriceInstant>>;

    async fn price_instants_for(&self, ids: &[i64]) -> StoreResult<Vec<PriceInstant>>;

    /// Overwrite the instants, append to the log and mark each item dirty
    async fn apply_price_changes(
        &self,
        changes: &[PriceChange],
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    // ---- candles ----

    /// Number of distinct items with a row (data or nulls) for this window
    async fn window_row_count(&self, granularity: Granularity, timestamp: i64) -> StoreResult<usize>;

    /// Upsert rows guarded by `Candle::supersedes`; returns rows written
    async fn upsert_candles(&self, granularity: Granularity, candles: &[Candle]) -> StoreResult<u64>;

    /// Most recent row per item at or before `at`, regardless of content
    async fn latest_candles(
        &self,
        granularity: Granularity,
        ids: &[i64],
        at: i64,
    ) -> StoreResult<HashMap<i64, Candle>>;

    /// Most recent row per item at or before `at` with a defined mid price
    async fn latest_priced_candles(
        &self,
        granularity: Granularity,
        ids: &[i64],
        at: i64,
    ) -> StoreResult<HashMap<i64, Candle>>;

    /// Priced rows inside each item's window
    async fn priced_candles_in_windows(
        &self,
        granularity: Granularity,
        windows: &[CandleWindow],
    ) -> StoreResult<Vec<Candle>>;

    /// Volume and turnover sums over `(since, until]`
    async fn candle_totals(
        &self,
        granularity: Granularity,
        ids: &[i64],
        since: i64,
        until: i64,
    ) -> StoreResult<HashMap<i64, CandleTotals>>;

    async fn latest_candle_timestamp(&self, granularity: Granularity) -> StoreResult<Option<i64>>;

    /// Delete rows with timestamp strictly before `cutoff`
    async fn delete_candles_before(&self, granularity: Granularity, cutoff: i64) -> StoreResult<u64>;

    // ---- dirty queue / canonical ----

    async fn dirty_count(&self) -> StoreResult<usize>;

    /// Oldest markers first
    async fn dirty_markers(&self, limit: usize) -> StoreResult<Vec<DirtyMarker>>;

    /// Upsert the records and drop the markers that were not touched again
    /// after they were read, atomically
    async fn commit_canonical(
        &self,
        records: &[CanonicalRecord],
        processed: &[DirtyMarker],
    ) -> StoreResult<()>;

    async fn canonical(&self, item_id: i64) -> StoreResult<Option<CanonicalRecord>>;

    // ---- retention ----

    async fn latest_log_observed_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// Delete log entries observed before `cutoff`, keeping the `keep` newest
    async fn prune_price_log(&self, cutoff: DateTime<Utc>, keep: i64) -> StoreResult<u64>;

    async fn latest_instant_update(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// Delete instants last written before `cutoff`, keeping the `keep` newest
    async fn prune_price_instants(&self, cutoff: DateTime<Utc>, keep: i64) -> StoreResult<u64>;
}
