// src/database/memory.rs
//
// In-process PriceStore with the same write guards as the PostgreSQL store.
// Every trait call takes the state lock once, so multi-row writes are atomic.
//
use crate::database::models::{
    CanonicalRecord, Candle, CandleTotals, CandleWindow, DirtyMarker, Item, PriceChange,
    PriceInstant, PriceInstantLogEntry, Side,
};
use crate::database::store::{PriceStore, StoreResult};
use crate::error::StoreError;
use crate::granularity::Granularity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<i64, Item>,
    instants: HashMap<(i64, Side), PriceInstant>,
    log: Vec<PriceInstantLogEntry>,
    candles: HashMap<Granularity, BTreeMap<(i64, i64), Candle>>,
    dirty: HashMap<i64, DateTime<Utc>>,
    canonical: HashMap<i64, CanonicalRecord>,
    failing_items: HashSet<i64>,
}

impl MemoryState {
    fn table(&self, granularity: Granularity) -> Option<&BTreeMap<(i64, i64), Candle>> {
        self.candles.get(&granularity)
    }

    fn table_mut(&mut self, granularity: Granularity) -> &mut BTreeMap<(i64, i64), Candle> {
        self.candles.entry(granularity).or_default()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_item(&self, item: Item) {
        self.state.lock().items.insert(item.item_id, item);
    }

    /// Raw insert that bypasses the upsert guard
    pub fn insert_candles(&self, granularity: Granularity, candles: &[Candle]) {
        let mut state = self.state.lock();
        let table = state.table_mut(granularity);
        for candle in candles {
            table.insert((candle.item_id, candle.timestamp), *candle);
        }
    }

    pub fn candles(&self, granularity: Granularity) -> Vec<Candle> {
        let state = self.state.lock();
        state
            .table(granularity)
            .map(|t| t.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn insert_instant(&self, instant: PriceInstant) {
        self.state
            .lock()
            .instants
            .insert((instant.item_id, instant.side), instant);
    }

    pub fn insert_log_entry(&self, entry: PriceInstantLogEntry) {
        self.state.lock().log.push(entry);
    }

    pub fn log_entries(&self) -> Vec<PriceInstantLogEntry> {
        self.state.lock().log.clone()
    }

    pub fn mark_dirty(&self, item_id: i64, touched_at: DateTime<Utc>) {
        self.state.lock().dirty.insert(item_id, touched_at);
    }

    pub fn dirty_items(&self) -> Vec<DirtyMarker> {
        let state = self.state.lock();
        let mut markers: Vec<DirtyMarker> = state
            .dirty
            .iter()
            .map(|(&item_id, &touched_at)| DirtyMarker { item_id, touched_at })
            .collect();
        markers.sort_by_key(|m| (m.touched_at, m.item_id));
        markers
    }

    pub fn insert_canonical(&self, record: CanonicalRecord) {
        self.state.lock().canonical.insert(record.item_id, record);
    }

    /// Make every canonical commit containing this item fail
    pub fn fail_commits_for(&self, item_id: i64) {
        self.state.lock().failing_items.insert(item_id);
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn items(&self) -> StoreResult<Vec<Item>> {
        Ok(self.state.lock().items.values().cloned().collect())
    }

    async fn items_by_id(&self, ids: &[i64]) -> StoreResult<Vec<Item>> {
        let state = self.state.lock();
        Ok(ids.iter().filter_map(|id| state.items.get(id).cloned()).collect())
    }

    async fn price_instants(&self) -> StoreResult<Vec<PriceInstant>> {
        Ok(self.state.lock().instants.values().cloned().collect())
    }

    async fn price_instants_for(&self, ids: &[i64]) -> StoreResult<Vec<PriceInstant>> {
        let state = self.state.lock();
        let mut instants = Vec::new();
        for id in ids {
            for side in Side::BOTH {
                if let Some(instant) = state.instants.get(&(*id, side)) {
                    instants.push(instant.clone());
                }
            }
        }
        Ok(instants)
    }

    async fn apply_price_changes(
        &self,
        changes: &[PriceChange],
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        for change in changes {
            state.instants.insert(
                (change.item_id, change.side),
                PriceInstant {
                    item_id: change.item_id,
                    side: change.side,
                    price: change.price,
                    source_time: change.source_time,
                    updated_at: observed_at,
                },
            );
            state.log.push(PriceInstantLogEntry {
                item_id: change.item_id,
                side: change.side,
                price: change.price,
                source_time: change.source_time,
                observed_at,
            });
            state.dirty.insert(change.item_id, observed_at);
        }
        Ok(())
    }

    async fn window_row_count(&self, granularity: Granularity, timestamp: i64) -> StoreResult<usize> {
        let state = self.state.lock();
        Ok(state
            .table(granularity)
            .map(|t| t.keys().filter(|(_, ts)| *ts == timestamp).count())
            .unwrap_or(0))
    }

    async fn upsert_candles(&self, granularity: Granularity, candles: &[Candle]) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let table = state.table_mut(granularity);
        let mut written = 0;
        for candle in candles {
            let key = (candle.item_id, candle.timestamp);
            let replace = table.get(&key).map_or(true, |existing| candle.supersedes(existing));
            if replace {
                table.insert(key, *candle);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn latest_candles(
        &self,
        granularity: Granularity,
        ids: &[i64],
        at: i64,
    ) -> StoreResult<HashMap<i64, Candle>> {
        let state = self.state.lock();
        let mut latest = HashMap::new();
        if let Some(table) = state.table(granularity) {
            for &id in ids {
                if let Some((_, candle)) = table.range((id, i64::MIN)..=(id, at)).next_back() {
                    latest.insert(id, *candle);
                }
            }
        }
        Ok(latest)
    }

    async fn latest_priced_candles(
        &self,
        granularity: Granularity,
        ids: &[i64],
        at: i64,
    ) -> StoreResult<HashMap<i64, Candle>> {
        let state = self.state.lock();
        let mut latest = HashMap::new();
        if let Some(table) = state.table(granularity) {
            for &id in ids {
                let found = table
                    .range((id, i64::MIN)..=(id, at))
                    .rev()
                    .map(|(_, c)| c)
                    .find(|c| c.mid().is_some());
                if let Some(candle) = found {
                    latest.insert(id, *candle);
                }
            }
        }
        Ok(latest)
    }

    async fn priced_candles_in_windows(
        &self,
        granularity: Granularity,
        windows: &[CandleWindow],
    ) -> StoreResult<Vec<Candle>> {
        let state = self.state.lock();
        let Some(table) = state.table(granularity) else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for window in windows {
            if window.from > window.to {
                continue;
            }
            found.extend(
                table
                    .range((window.item_id, window.from)..=(window.item_id, window.to))
                    .map(|(_, c)| *c)
                    .filter(|c| c.mid().is_some()),
            );
        }
        Ok(found)
    }

    async fn candle_totals(
        &self,
        granularity: Granularity,
        ids: &[i64],
        since: i64,
        until: i64,
    ) -> StoreResult<HashMap<i64, CandleTotals>> {
        let state = self.state.lock();
        let mut totals = HashMap::new();
        let Some(table) = state.table(granularity) else {
            return Ok(totals);
        };
        for &id in ids {
            let mut rows = table.range((id, since.saturating_add(1))..=(id, until)).peekable();
            if rows.peek().is_none() {
                continue;
            }
            let mut sum = CandleTotals::default();
            for (_, c) in rows {
                let high_volume = c.high_price_volume.unwrap_or(0);
                let low_volume = c.low_price_volume.unwrap_or(0);
                sum.high_volume += high_volume;
                sum.low_volume += low_volume;
                sum.high_turnover += c.avg_high_price.unwrap_or(0) as f64 * high_volume as f64;
                sum.low_turnover += c.avg_low_price.unwrap_or(0) as f64 * low_volume as f64;
            }
            totals.insert(id, sum);
        }
        Ok(totals)
    }

    async fn latest_candle_timestamp(&self, granularity: Granularity) -> StoreResult<Option<i64>> {
        let state = self.state.lock();
        Ok(state
            .table(granularity)
            .and_then(|t| t.keys().map(|(_, ts)| *ts).max()))
    }

    async fn delete_candles_before(&self, granularity: Granularity, cutoff: i64) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let table = state.table_mut(granularity);
        let before = table.len();
        table.retain(|(_, ts), _| *ts >= cutoff);
        Ok((before - table.len()) as u64)
    }

    async fn dirty_count(&self) -> StoreResult<usize> {
        Ok(self.state.lock().dirty.len())
    }

    async fn dirty_markers(&self, limit: usize) -> StoreResult<Vec<DirtyMarker>> {
        let mut markers = self.dirty_items();
        markers.truncate(limit);
        Ok(markers)
    }

    async fn commit_canonical(
        &self,
        records: &[CanonicalRecord],
        processed: &[DirtyMarker],
    ) -> StoreResult<()> {
        let mut state = self.state.lock();

        if let Some(record) = records.iter().find(|r| state.failing_items.contains(&r.item_id)) {
            return Err(StoreError::Rejected(format!(
                "injected failure for item {}",
                record.item_id
            )));
        }

        for record in records {
            let newer = state
                .canonical
                .get(&record.item_id)
                .map_or(true, |existing| existing.timestamp_updated <= record.timestamp_updated);
            if newer {
                state.canonical.insert(record.item_id, record.clone());
            }
        }

        for marker in processed {
            if state
                .dirty
                .get(&marker.item_id)
                .is_some_and(|touched| *touched <= marker.touched_at)
            {
                state.dirty.remove(&marker.item_id);
            }
        }
        Ok(())
    }

    async fn canonical(&self, item_id: i64) -> StoreResult<Option<CanonicalRecord>> {
        Ok(self.state.lock().canonical.get(&item_id).cloned())
    }

    async fn latest_log_observed_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().log.iter().map(|e| e.observed_at).max())
    }

    async fn prune_price_log(&self, cutoff: DateTime<Utc>, keep: i64) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let before = state.log.len();

        let mut order: Vec<usize> = (0..state.log.len()).collect();
        order.sort_by(|&a, &b| state.log[b].observed_at.cmp(&state.log[a].observed_at).then(b.cmp(&a)));
        let protected: HashSet<usize> = order.into_iter().take(keep.max(0) as usize).collect();

        let mut index = 0;
        state.log.retain(|entry| {
            let keep_entry = protected.contains(&index) || entry.observed_at >= cutoff;
            index += 1;
            keep_entry
        });
        Ok((before - state.log.len()) as u64)
    }

    async fn latest_instant_update(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().instants.values().map(|i| i.updated_at).max())
    }

    async fn prune_price_instants(&self, cutoff: DateTime<Utc>, keep: i64) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let before = state.instants.len();

        let mut newest: Vec<((i64, Side), DateTime<Utc>)> = state
            .instants
            .iter()
            .map(|(key, instant)| (*key, instant.updated_at))
            .collect();
        newest.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let protected: HashSet<(i64, Side)> = newest
            .into_iter()
            .take(keep.max(0) as usize)
            .map(|(key, _)| key)
            .collect();

        state
            .instants
            .retain(|key, instant| protected.contains(key) || instant.updated_at >= cutoff);
        Ok((before - state.instants.len()) as u64)
    }
}
