mod common;

use common::{quote, seeded_store, temp_locks, ScriptedSource, TempDir};
use price_aggregator::database::models::Side;
use price_aggregator::database::{MemoryStore, PriceStore};
use price_aggregator::error::{FetchError, IngestError};
use price_aggregator::granularity::Granularity;
use price_aggregator::ingest::{CandleIngestor, IngestOutcome, LatestIngestor, SkipReason};
use price_aggregator::upstream::LatestQuote;
use std::sync::Arc;

const WINDOW: i64 = 1_700_000_100;

fn candle_ingestor(
    store: &Arc<MemoryStore>,
    source: &Arc<ScriptedSource>,
) -> (CandleIngestor, TempDir) {
    let (locks, dir) = temp_locks();
    (CandleIngestor::new(store.clone(), source.clone(), locks), TempDir(dir))
}

#[tokio::test]
async fn window_is_written_once_and_then_skipped_without_fetching() {
    let store = Arc::new(seeded_store(&[1, 2, 3]));
    let source = Arc::new(ScriptedSource::new());
    source.set_window_quote(1, quote(110, 90));
    source.set_window_quote(2, quote(55, 45));
    let (ingestor, _dir) = candle_ingestor(&store, &source);

    let first = ingestor.ingest(Granularity::FiveMinutes, WINDOW).await.unwrap();
    // item 3 had no trades and still gets an all-null row
    assert_eq!(first, IngestOutcome::Written { rows: 3 });
    assert_eq!(store.window_row_count(Granularity::FiveMinutes, WINDOW).await.unwrap(), 3);

    let second = ingestor.ingest(Granularity::FiveMinutes, WINDOW).await.unwrap();
    assert_eq!(second, IngestOutcome::AlreadyPopulated);
    assert_eq!(source.window_calls(), 1);

    let rows = store.candles(Granularity::FiveMinutes);
    let empty = rows.iter().find(|c| c.item_id == 3).unwrap();
    assert!(empty.avg_high_price.is_none() && empty.avg_low_price.is_none());
}

#[tokio::test]
async fn lagging_window_is_rejected_and_nothing_is_written() {
    let store = Arc::new(seeded_store(&[1]));
    let source = Arc::new(ScriptedSource::new());
    source.set_window_quote(1, quote(110, 90));
    source.serve_window(Granularity::OneHour, WINDOW - 3_600);
    let (ingestor, _dir) = candle_ingestor(&store, &source);

    let err = ingestor.ingest(Granularity::OneHour, WINDOW).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::RetryableFetch(FetchError::WindowMismatch { .. })
    ));
    assert!(err.is_retryable());
    assert!(store.candles(Granularity::OneHour).is_empty());
}

#[tokio::test]
async fn empty_window_snapshot_is_retryable() {
    let store = Arc::new(seeded_store(&[1]));
    let source = Arc::new(ScriptedSource::new());
    let (ingestor, _dir) = candle_ingestor(&store, &source);

    let err = ingestor.ingest(Granularity::FiveMinutes, WINDOW).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::RetryableFetch(FetchError::EmptySnapshot(_))
    ));
    assert!(store.candles(Granularity::FiveMinutes).is_empty());
}

#[tokio::test]
async fn scheduled_ingest_yields_to_a_running_backfill() {
    let store = Arc::new(seeded_store(&[1]));
    let source = Arc::new(ScriptedSource::new());
    source.set_window_quote(1, quote(110, 90));
    let (locks, dir) = temp_locks();
    let ingestor = CandleIngestor::new(store.clone(), source.clone(), locks.clone());

    let backfill = locks.guard(&Granularity::SixHours.backfill_lock()).unwrap().unwrap();
    let outcome = ingestor.ingest(Granularity::SixHours, WINDOW).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::BackfillLockHeld));
    assert_eq!(source.window_calls(), 0);

    // Other granularities are unaffected
    let other = ingestor.ingest(Granularity::FiveMinutes, WINDOW).await.unwrap();
    assert_eq!(other, IngestOutcome::Written { rows: 1 });

    drop(backfill);
    let after = ingestor.ingest(Granularity::SixHours, WINDOW).await.unwrap();
    assert_eq!(after, IngestOutcome::Written { rows: 1 });

    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn backfill_walks_aligned_windows_and_skips_populated_ones() {
    let store = Arc::new(seeded_store(&[1]));
    let source = Arc::new(ScriptedSource::new());
    source.set_window_quote(1, quote(110, 90));
    let (locks, dir) = temp_locks();
    let ingestor = CandleIngestor::new(store.clone(), source.clone(), locks);

    // WINDOW is 5m aligned; start one second later so the first window is WINDOW + 300
    ingestor.ingest(Granularity::FiveMinutes, WINDOW + 600).await.unwrap();
    let report = ingestor
        .backfill(Granularity::FiveMinutes, WINDOW + 1, WINDOW + 900)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.windows, 3);
    assert_eq!(report.written, 2);
    assert_eq!(report.already_populated, 1);
    assert!(report.failed.is_empty());

    let stamps: Vec<i64> = store
        .candles(Granularity::FiveMinutes)
        .iter()
        .map(|c| c.timestamp)
        .collect();
    assert_eq!(stamps, vec![WINDOW + 300, WINDOW + 600, WINDOW + 900]);

    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn repeated_latest_snapshot_is_logged_once() {
    let store = Arc::new(seeded_store(&[7]));
    let source = Arc::new(ScriptedSource::new());
    source.latest.lock().quotes.insert(
        7,
        LatestQuote {
            high: Some(120),
            high_time: Some(1_700_000_000),
            low: Some(100),
            low_time: Some(1_700_000_010),
        },
    );
    let ingestor = LatestIngestor::new(store.clone(), source.clone());

    let report = ingestor.ingest().await.unwrap();
    assert_eq!(report.changes, 2);
    assert_eq!(report.items, 1);

    let err = ingestor.ingest().await.unwrap_err();
    assert!(matches!(err, IngestError::NoChangeDetected));

    assert_eq!(store.log_entries().len(), 2);
    assert_eq!(store.dirty_items().len(), 1);
    assert_eq!(store.dirty_count().await.unwrap(), 1);

    let instants = store.price_instants().await.unwrap();
    let high = instants.iter().find(|i| i.side == Side::High).unwrap();
    assert_eq!((high.price, high.source_time), (120, 1_700_000_000));
}

#[tokio::test]
async fn latest_quotes_for_unknown_items_are_ignored() {
    let store = Arc::new(seeded_store(&[7]));
    let source = Arc::new(ScriptedSource::new());
    source.latest.lock().quotes.insert(
        999,
        LatestQuote {
            high: Some(5),
            high_time: Some(1_700_000_000),
            ..Default::default()
        },
    );
    let ingestor = LatestIngestor::new(store.clone(), source);

    assert!(matches!(ingestor.ingest().await, Err(IngestError::NoChangeDetected)));
    assert!(store.log_entries().is_empty());
    assert!(store.dirty_items().is_empty());
}
