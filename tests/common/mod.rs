#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use price_aggregator::database::models::Item;
use price_aggregator::database::MemoryStore;
use price_aggregator::error::FetchError;
use price_aggregator::granularity::Granularity;
use price_aggregator::lock::LockManager;
use price_aggregator::upstream::{LatestSnapshot, PriceSource, WindowQuote, WindowSnapshot};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A price source serving canned snapshots and counting calls
#[derive(Default)]
pub struct ScriptedSource {
    pub latest: Mutex<LatestSnapshot>,
    /// Window served per granularity; `None` serves exactly what was requested
    pub served_window: Mutex<HashMap<Granularity, i64>>,
    pub window_quotes: Mutex<HashMap<i64, WindowQuote>>,
    pub latest_calls: AtomicUsize,
    pub window_calls: AtomicUsize,
    /// Time every fetch spends "on the wire"
    pub fetch_delay: Mutex<Duration>,
    /// Start and end of every fetch, in completion order
    pub events: Mutex<Vec<&'static str>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_window_quote(&self, item_id: i64, quote: WindowQuote) {
        self.window_quotes.lock().insert(item_id, quote);
    }

    /// Make the source lag: every window request is answered with `timestamp`
    pub fn serve_window(&self, granularity: Granularity, timestamp: i64) {
        self.served_window.lock().insert(granularity, timestamp);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    async fn on_the_wire(&self, start: &'static str, end: &'static str) {
        self.events.lock().push(start);
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.events.lock().push(end);
    }

    pub fn window_calls(&self) -> usize {
        self.window_calls.load(Ordering::SeqCst)
    }

    pub fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for ScriptedSource {
    async fn fetch_latest(&self) -> Result<LatestSnapshot, FetchError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        self.on_the_wire("latest_start", "latest_end").await;
        Ok(self.latest.lock().clone())
    }

    async fn fetch_window(
        &self,
        granularity: Granularity,
        timestamp: i64,
    ) -> Result<WindowSnapshot, FetchError> {
        self.window_calls.fetch_add(1, Ordering::SeqCst);
        self.on_the_wire("window_start", "window_end").await;
        let served = self
            .served_window
            .lock()
            .get(&granularity)
            .copied()
            .unwrap_or(timestamp);
        Ok(WindowSnapshot {
            timestamp: Some(served),
            quotes: self.window_quotes.lock().clone(),
        })
    }
}

pub fn quote(high: i64, low: i64) -> WindowQuote {
    WindowQuote {
        avg_high_price: Some(high),
        high_price_volume: Some(10),
        avg_low_price: Some(low),
        low_price_volume: Some(20),
    }
}

/// Removes the wrapped directory when dropped
pub struct TempDir(pub PathBuf);

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Lock manager over a fresh directory under the system temp dir
pub fn temp_locks() -> (LockManager, PathBuf) {
    let dir = std::env::temp_dir().join(format!(
        "price-aggregator-test-{}",
        uuid::Uuid::new_v4().simple()
    ));
    let locks = LockManager::new(&dir).unwrap();
    (locks, dir)
}

pub fn seeded_store(ids: &[i64]) -> MemoryStore {
    let store = MemoryStore::new();
    for &id in ids {
        let mut item = Item::new(id, format!("Item {}", id));
        item.buy_limit = Some(100);
        store.insert_item(item);
    }
    store
}
