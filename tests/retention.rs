mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{seeded_store, temp_locks, TempDir};
use price_aggregator::cleanup::{retention_cutoff, RetentionCleaner, CLEANUP_LOCK};
use price_aggregator::config::RetentionConfig;
use price_aggregator::database::models::{Candle, PriceInstant, PriceInstantLogEntry, Side};
use price_aggregator::database::{MemoryStore, PriceStore};
use price_aggregator::granularity::Granularity;
use std::sync::Arc;

const LATEST: i64 = 1_700_006_400;

fn retention_cleaner(
    store: &Arc<MemoryStore>,
    config: RetentionConfig,
) -> (RetentionCleaner, TempDir) {
    let (locks, dir) = temp_locks();
    (RetentionCleaner::new(store.clone(), locks, config), TempDir(dir))
}

#[tokio::test]
async fn five_minute_table_keeps_its_retention_window() {
    let store = Arc::new(seeded_store(&[1]));
    // 25 hours of 5m candles ending at LATEST
    let candles: Vec<Candle> = (0..=300)
        .map(|k| Candle::empty(1, LATEST - k * 300))
        .collect();
    store.insert_candles(Granularity::FiveMinutes, &candles);

    let (cleaner, _dir) = retention_cleaner(&store, RetentionConfig::default());
    let report = cleaner
        .cleanup()
        .await
        .unwrap()
        .unwrap();

    let cutoff = retention_cutoff(LATEST, Granularity::FiveMinutes);
    let prune = report
        .candles
        .iter()
        .find(|p| p.granularity == Granularity::FiveMinutes)
        .unwrap();
    assert_eq!(prune.cutoff, cutoff);
    assert_eq!(prune.deleted, 9);

    let left = store.candles(Granularity::FiveMinutes);
    assert_eq!(left.len(), 292);
    assert!(left.iter().all(|c| c.timestamp >= cutoff));
    assert!(left.iter().any(|c| c.timestamp == LATEST));
    // Empty tables are left alone
    assert!(report.candles.iter().all(|p| p.granularity == Granularity::FiveMinutes));
}

#[tokio::test]
async fn log_pruning_is_anchored_to_the_newest_entry_and_keeps_recent_rows() {
    let store = Arc::new(seeded_store(&[1]));
    let newest = Utc.timestamp_opt(LATEST, 0).unwrap();
    for hours_back in 0..6 {
        store.insert_log_entry(PriceInstantLogEntry {
            item_id: 1,
            side: Side::High,
            price: 100 + hours_back,
            source_time: LATEST - hours_back * 3_600,
            observed_at: newest - Duration::hours(hours_back),
        });
    }

    let config = RetentionConfig {
        log_retention_secs: 3_600,
        keep_recent: 0,
        ..Default::default()
    };
    let (first, _first_dir) = retention_cleaner(&store, config);
    let report = first.cleanup().await.unwrap().unwrap();
    // Entries 0h and 1h back survive
    assert_eq!(report.log_deleted, 4);
    assert_eq!(store.log_entries().len(), 2);

    let config = RetentionConfig {
        log_retention_secs: 60,
        keep_recent: 2,
        ..Default::default()
    };
    let (second, _second_dir) = retention_cleaner(&store, config);
    let report = second.cleanup().await.unwrap().unwrap();
    assert_eq!(report.log_deleted, 0);
    assert_eq!(store.log_entries().len(), 2);
}

#[tokio::test]
async fn stale_instants_are_pruned_except_the_most_recent() {
    let store = Arc::new(seeded_store(&[1, 2, 3, 4]));
    let newest = Utc.timestamp_opt(LATEST, 0).unwrap();
    for (item_id, days_back) in [(1, 0), (2, 10), (3, 20), (4, 30)] {
        store.insert_instant(PriceInstant {
            item_id,
            side: Side::Low,
            price: 50,
            source_time: LATEST - days_back * 86_400,
            updated_at: newest - Duration::days(days_back),
        });
    }

    let config = RetentionConfig {
        instant_retention_secs: 5 * 86_400,
        keep_recent: 2,
        ..Default::default()
    };
    let (cleaner, _dir) = retention_cleaner(&store, config);
    let report = cleaner.cleanup().await.unwrap().unwrap();

    // Only item 1 is inside the window; item 2 is one of the two newest
    assert_eq!(report.instants_deleted, 2);
    assert_eq!(report.log_deleted, 0);
    let mut left: Vec<i64> = store
        .price_instants()
        .await
        .unwrap()
        .iter()
        .map(|i| i.item_id)
        .collect();
    left.sort_unstable();
    assert_eq!(left, vec![1, 2]);
}

#[tokio::test]
async fn held_cleanup_lock_skips_the_run() {
    let store = Arc::new(seeded_store(&[1]));
    store.insert_candles(Granularity::OneHour, &[Candle::empty(1, 0), Candle::empty(1, LATEST)]);
    let (locks, dir) = temp_locks();
    let cleaner = RetentionCleaner::new(store.clone(), locks.clone(), RetentionConfig::default());

    let held = locks.guard(CLEANUP_LOCK).unwrap().unwrap();
    assert!(cleaner.cleanup().await.unwrap().is_none());
    assert_eq!(store.candles(Granularity::OneHour).len(), 2);

    drop(held);
    let report = cleaner.cleanup().await.unwrap().unwrap();
    assert_eq!(report.candles[0].deleted, 1);
    assert_eq!(store.candles(Granularity::OneHour).len(), 1);

    std::fs::remove_dir_all(dir).unwrap();
}
