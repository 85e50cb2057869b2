use crate::database::models::{PriceChange, PriceInstant, Side};
use crate::database::store::PriceStore;
use crate::error::{FetchError, IngestError};
use crate::upstream::{LatestSnapshot, PriceSource};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatestReport {
    pub changes: usize,
    pub items: usize,
}

/// Accepted per-side changes between the stored instants and a snapshot.
/// A side changes when its price or source time differs; an older source time
/// is a regression and is dropped.
pub fn detect_changes(
    current: &HashMap<(i64, Side), PriceInstant>,
    snapshot: &LatestSnapshot,
) -> Vec<PriceChange> {
    let mut changes = Vec::new();
    for (&item_id, quote) in &snapshot.quotes {
        for (side, price, time) in [
            (Side::High, quote.high, quote.high_time),
            (Side::Low, quote.low, quote.low_time),
        ] {
            let (Some(price), Some(source_time)) = (price, time) else {
                continue;
            };
            let accepted = match current.get(&(item_id, side)) {
                None => true,
                Some(existing) if source_time < existing.source_time => false,
                Some(existing) => existing.price != price || existing.source_time != source_time,
            };
            if accepted {
                changes.push(PriceChange {
                    item_id,
                    side,
                    price,
                    source_time,
                });
            }
        }
    }
    changes.sort_by_key(|c| (c.item_id, c.side));
    changes
}

pub struct LatestIngestor {
    store: Arc<dyn PriceStore>,
    source: Arc<dyn PriceSource>,
}

impl LatestIngestor {
    pub fn new(store: Arc<dyn PriceStore>, source: Arc<dyn PriceSource>) -> Self {
        Self { store, source }
    }

    #[instrument(skip(self))]
    pub async fn ingest(&self) -> Result<LatestReport, IngestError> {
        let mut snapshot = self.source.fetch_latest().await?;
        if snapshot.quotes.is_empty() {
            return Err(FetchError::EmptySnapshot("latest".to_string()).into());
        }

        let known: HashSet<i64> = self.store.items().await?.into_iter().map(|i| i.item_id).collect();
        snapshot.quotes.retain(|id, _| known.contains(id));

        let current: HashMap<(i64, Side), PriceInstant> = self
            .store
            .price_instants()
            .await?
            .into_iter()
            .map(|instant| ((instant.item_id, instant.side), instant))
            .collect();

        let changes = detect_changes(&current, &snapshot);
        if changes.is_empty() {
            debug!("Latest snapshot of {} items carried no changes", snapshot.quotes.len());
            return Err(IngestError::NoChangeDetected);
        }

        self.store.apply_price_changes(&changes, Utc::now()).await?;

        let items = changes.iter().map(|c| c.item_id).collect::<HashSet<_>>().len();
        info!("Accepted {} latest price changes across {} items", changes.len(), items);
        Ok(LatestReport {
            changes: changes.len(),
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::LatestQuote;
    use chrono::TimeZone;

    fn instant(item_id: i64, side: Side, price: i64, source_time: i64) -> ((i64, Side), PriceInstant) {
        (
            (item_id, side),
            PriceInstant {
                item_id,
                side,
                price,
                source_time,
                updated_at: Utc.timestamp_opt(0, 0).unwrap(),
            },
        )
    }

    fn snapshot(quotes: &[(i64, LatestQuote)]) -> LatestSnapshot {
        LatestSnapshot {
            quotes: quotes.iter().copied().collect(),
        }
    }

    fn quote(high: i64, high_time: i64, low: i64, low_time: i64) -> LatestQuote {
        LatestQuote {
            high: Some(high),
            high_time: Some(high_time),
            low: Some(low),
            low_time: Some(low_time),
        }
    }

    #[test]
    fn first_sighting_accepts_both_sides() {
        let changes = detect_changes(&HashMap::new(), &snapshot(&[(4, quote(10, 100, 9, 90))]));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].side, Side::High);
        assert_eq!(changes[1].price, 9);
    }

    #[test]
    fn duplicate_snapshot_changes_nothing() {
        let current = HashMap::from([instant(4, Side::High, 10, 100), instant(4, Side::Low, 9, 90)]);
        assert!(detect_changes(&current, &snapshot(&[(4, quote(10, 100, 9, 90))])).is_empty());
    }

    #[test]
    fn time_alone_counts_as_a_change() {
        let current = HashMap::from([instant(4, Side::High, 10, 100), instant(4, Side::Low, 9, 90)]);
        let changes = detect_changes(&current, &snapshot(&[(4, quote(10, 160, 9, 90))]));
        assert_eq!(
            changes,
            vec![PriceChange {
                item_id: 4,
                side: Side::High,
                price: 10,
                source_time: 160
            }]
        );
    }

    #[test]
    fn regressions_and_missing_sides_are_ignored() {
        let current = HashMap::from([instant(4, Side::High, 10, 100)]);
        let stale = LatestQuote {
            high: Some(11),
            high_time: Some(50),
            low: None,
            low_time: None,
        };
        assert!(detect_changes(&current, &snapshot(&[(4, stale)])).is_empty());
    }
}
