use crate::aggregation::trend::TrendHorizon;
use crate::aggregation::metrics::StatsWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference data for one tradable item. Maintained outside this pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Item {
    pub item_id: i64,
    pub name: String,
    pub tradeable: bool,
    /// Maximum quantity per trade window
    pub buy_limit: Option<i64>,
    pub value: Option<i64>,
    pub high_alch: Option<i64>,
    pub low_alch: Option<i64>,
}

impl Item {
    pub fn new(item_id: i64, name: impl Into<String>) -> Self {
        Self {
            item_id,
            name: name.into(),
            tradeable: true,
            buy_limit: None,
            value: None,
            high_alch: None,
            low_alch: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    High,
    Low,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::High, Side::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Side::High => "high",
            Side::Low => "low",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Side::High),
            "low" => Ok(Side::Low),
            other => Err(format!("Unknown price side '{}'", other)),
        }
    }
}

/// Live cache of the current price on one side of an item
#[derive(Debug, Clone, PartialEq)]
pub struct PriceInstant {
    pub item_id: i64,
    pub side: Side,
    pub price: i64,
    /// Time the upstream source attributes to the price (unix seconds)
    pub source_time: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceInstantLogEntry {
    pub item_id: i64,
    pub side: Side,
    pub price: i64,
    pub source_time: i64,
    pub observed_at: DateTime<Utc>,
}

/// An accepted change to one side of an item's current price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceChange {
    pub item_id: i64,
    pub side: Side,
    pub price: i64,
    pub source_time: i64,
}

/// One averaged window for one item. All-null rows mean "checked, no trades".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Candle {
    pub item_id: i64,
    pub timestamp: i64,
    pub avg_high_price: Option<i64>,
    pub high_price_volume: Option<i64>,
    pub avg_low_price: Option<i64>,
    pub low_price_volume: Option<i64>,
}

impl Candle {
    pub fn empty(item_id: i64, timestamp: i64) -> Self {
        Self {
            item_id,
            timestamp,
            avg_high_price: None,
            high_price_volume: None,
            avg_low_price: None,
            low_price_volume: None,
        }
    }

    /// Midpoint of the averaged prices, falling back to whichever side exists
    pub fn mid(&self) -> Option<f64> {
        match (self.avg_high_price, self.avg_low_price) {
            (Some(high), Some(low)) => Some((high as f64 + low as f64) / 2.0),
            (Some(high), None) => Some(high as f64),
            (None, Some(low)) => Some(low as f64),
            (None, None) => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.avg_high_price.is_some() && self.avg_low_price.is_some()
    }

    pub fn total_volume(&self) -> Option<i64> {
        match (self.high_price_volume, self.low_price_volume) {
            (None, None) => None,
            (high, low) => Some(high.unwrap_or(0) + low.unwrap_or(0)),
        }
    }

    fn payload(&self) -> (Option<i64>, Option<i64>, Option<i64>, Option<i64>) {
        (
            self.avg_high_price,
            self.high_price_volume,
            self.avg_low_price,
            self.low_price_volume,
        )
    }

    /// Whether `self` may replace `existing` for the same key. Identical rows
    /// are never rewritten, and a complete row only yields to another complete one.
    pub fn supersedes(&self, existing: &Candle) -> bool {
        if self.payload() == existing.payload() {
            return false;
        }
        !existing.is_complete() || self.is_complete()
    }
}

/// A queued "canonical row is stale" marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyMarker {
    pub item_id: i64,
    pub touched_at: DateTime<Utc>,
}

/// Per-item candle search range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleWindow {
    pub item_id: i64,
    pub from: i64,
    pub to: i64,
}

/// Summed volumes and turnover over a span of candles
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CandleTotals {
    pub high_volume: i64,
    pub low_volume: i64,
    pub high_turnover: f64,
    pub low_turnover: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub volume: Option<i64>,
    pub turnover: Option<i64>,
    /// Ratio of volume traded at the high side to volume at the low side
    pub buy_sell_rate: Option<f64>,
}

/// The materialized summary row consumers read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub item_id: i64,
    pub name: String,
    pub tradeable: bool,
    pub buy_limit: Option<i64>,
    pub value: Option<i64>,
    pub high_alch: Option<i64>,
    pub low_alch: Option<i64>,

    pub high: Option<i64>,
    pub high_time: Option<i64>,
    pub low: Option<i64>,
    pub low_time: Option<i64>,

    pub margin: Option<i64>,
    pub roi: Option<f64>,
    pub spread: Option<i64>,
    pub max_profit: Option<i64>,
    pub max_investment: Option<i64>,

    pub window_stats: [WindowStats; StatsWindow::COUNT],
    pub trends: [Option<f64>; TrendHorizon::COUNT],

    pub timestamp_updated: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn stats(&self, window: StatsWindow) -> &WindowStats {
        &self.window_stats[window.index()]
    }

    pub fn trend(&self, horizon: TrendHorizon) -> Option<f64> {
        self.trends[horizon.index()]
    }
}
