mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{seeded_store, temp_locks, TempDir};
use price_aggregator::aggregation::trend::TrendHorizon;
use price_aggregator::aggregation::{Reconciler, RECONCILE_LOCK};
use price_aggregator::config::{AggregationConfig, FeeConfig};
use price_aggregator::database::models::{Candle, PriceInstant, Side};
use price_aggregator::database::{MemoryStore, PriceStore};
use price_aggregator::granularity::Granularity;
use std::sync::Arc;

const NOW: i64 = 1_700_006_400;

fn priced(item_id: i64, timestamp: i64, high: i64, low: i64) -> Candle {
    Candle {
        item_id,
        timestamp,
        avg_high_price: Some(high),
        high_price_volume: Some(40),
        avg_low_price: Some(low),
        low_price_volume: Some(60),
    }
}

fn batched_reconciler(store: &Arc<MemoryStore>, batch_size: usize) -> (Reconciler, TempDir) {
    let (locks, dir) = temp_locks();
    let config = AggregationConfig {
        batch_size,
        concurrency: 2,
        ..Default::default()
    };
    (
        Reconciler::new(store.clone(), locks, config, FeeConfig::default()),
        TempDir(dir),
    )
}

fn seed_instants(store: &MemoryStore, item_id: i64, high: i64, low: i64) {
    for (side, price) in [(Side::High, high), (Side::Low, low)] {
        store.insert_instant(PriceInstant {
            item_id,
            side,
            price,
            source_time: NOW - 30,
            updated_at: Utc.timestamp_opt(NOW - 20, 0).unwrap(),
        });
    }
}

#[tokio::test]
async fn drain_clears_the_queue_and_writes_fresh_records() {
    let store = Arc::new(seeded_store(&[1, 2, 3]));
    let touched = Utc.timestamp_opt(NOW - 60, 0).unwrap();
    for id in [1, 2, 3] {
        seed_instants(&store, id, 110, 100);
        store.mark_dirty(id, touched);
    }

    let first = Utc.timestamp_opt(NOW, 0).unwrap();
    let (reconciler, _dir) = batched_reconciler(&store, 2);
    let report = reconciler.reconcile_at(first).await.unwrap().unwrap();
    assert_eq!(report.markers, 3);
    assert_eq!(report.batches, 2);
    assert_eq!(report.records, 3);
    assert_eq!(report.failed_batches, 0);
    assert_eq!(store.dirty_count().await.unwrap(), 0);

    let record = store.canonical(1).await.unwrap().unwrap();
    assert_eq!(record.timestamp_updated, first);
    assert_eq!((record.high, record.low), (Some(110), Some(100)));
    assert_eq!(record.high_time, Some(NOW - 30));

    // A later touch makes the item dirty again and advances its record
    store.mark_dirty(1, first + Duration::seconds(5));
    let second = first + Duration::seconds(60);
    reconciler.reconcile_at(second).await.unwrap().unwrap();
    let record = store.canonical(1).await.unwrap().unwrap();
    assert_eq!(record.timestamp_updated, second);
    assert_eq!(store.dirty_count().await.unwrap(), 0);
}

#[tokio::test]
async fn marker_touched_after_it_was_read_survives_the_commit() {
    let store = Arc::new(seeded_store(&[1, 2]));
    let read_at = Utc.timestamp_opt(NOW - 60, 0).unwrap();
    for id in [1, 2] {
        seed_instants(&store, id, 110, 100);
        store.mark_dirty(id, read_at);
    }

    let stale = store.dirty_markers(10).await.unwrap();
    assert_eq!(stale.len(), 2);
    // New prices for item 1 land while the batch is being computed
    store.mark_dirty(1, read_at + Duration::seconds(5));

    store.commit_canonical(&[], &stale).await.unwrap();
    let remaining = store.dirty_items();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].item_id, 1);
    assert_eq!(remaining[0].touched_at, read_at + Duration::seconds(5));

    // The next run picks it up
    let (reconciler, _dir) = batched_reconciler(&store, 10);
    let report = reconciler
        .reconcile_at(Utc.timestamp_opt(NOW, 0).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.markers, 1);
    assert_eq!(report.records, 1);
    assert_eq!(store.dirty_count().await.unwrap(), 0);
    assert!(store.canonical(1).await.unwrap().is_some());
}

#[tokio::test]
async fn one_hour_trend_compares_against_the_candle_an_hour_back() {
    let store = Arc::new(seeded_store(&[4]));
    let latest = NOW - 300;
    store.insert_candles(
        Granularity::FiveMinutes,
        &[
            priced(4, latest - 3_600, 105, 95),
            priced(4, latest - 1_800, 200, 180),
            priced(4, latest, 115, 105),
        ],
    );
    store.mark_dirty(4, Utc.timestamp_opt(NOW - 10, 0).unwrap());

    let (reconciler, _dir) = batched_reconciler(&store, 10);
    reconciler
        .reconcile_at(Utc.timestamp_opt(NOW, 0).unwrap())
        .await
        .unwrap()
        .unwrap();

    let record = store.canonical(4).await.unwrap().unwrap();
    // mid 110 against mid 100
    assert_eq!(record.trend(TrendHorizon::OneHour), Some(10.0));
    // nothing a day back in the 1h table
    assert_eq!(record.trend(TrendHorizon::TwentyFourHours), None);
}

#[tokio::test]
async fn failing_batch_is_isolated_from_the_others() {
    let store = Arc::new(seeded_store(&[1, 2, 3]));
    for (offset, id) in [1, 2, 3].into_iter().enumerate() {
        seed_instants(&store, id, 110, 100);
        store.mark_dirty(id, Utc.timestamp_opt(NOW - 60 + offset as i64, 0).unwrap());
    }
    store.fail_commits_for(2);

    let (reconciler, _dir) = batched_reconciler(&store, 1);
    let report = reconciler
        .reconcile_at(Utc.timestamp_opt(NOW, 0).unwrap())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.records, 2);

    assert!(store.canonical(1).await.unwrap().is_some());
    assert!(store.canonical(2).await.unwrap().is_none());
    assert!(store.canonical(3).await.unwrap().is_some());

    let remaining: Vec<i64> = store.dirty_items().iter().map(|m| m.item_id).collect();
    assert_eq!(remaining, vec![2]);
}

#[tokio::test]
async fn markers_for_items_outside_the_catalogue_are_cleared() {
    let store = Arc::new(seeded_store(&[1]));
    store.mark_dirty(42, Utc.timestamp_opt(NOW - 5, 0).unwrap());

    let (reconciler, _dir) = batched_reconciler(&store, 10);
    let report = reconciler
        .reconcile_at(Utc.timestamp_opt(NOW, 0).unwrap())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.markers, 1);
    assert_eq!(report.records, 0);
    assert_eq!(store.dirty_count().await.unwrap(), 0);
    assert!(store.canonical(42).await.unwrap().is_none());
}

#[tokio::test]
async fn held_reconcile_lock_skips_the_run() {
    let store = Arc::new(seeded_store(&[1]));
    store.mark_dirty(1, Utc.timestamp_opt(NOW - 5, 0).unwrap());
    let (locks, dir) = temp_locks();
    let reconciler = Reconciler::new(
        store.clone(),
        locks.clone(),
        AggregationConfig::default(),
        FeeConfig::default(),
    );

    let _held = locks.guard(RECONCILE_LOCK).unwrap().unwrap();
    assert!(reconciler.reconcile().await.unwrap().is_none());
    assert_eq!(store.dirty_count().await.unwrap(), 1);

    drop(_held);
    std::fs::remove_dir_all(dir).unwrap();
}
