//! The upstream price source: one snapshot per call, either the current
//! per-side prices or one averaged window per granularity.
pub mod http;

use crate::database::models::Candle;
use crate::error::FetchError;
use crate::granularity::Granularity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use http::HttpPriceSource;

/// Current price on both sides of one item, as the source reports it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestQuote {
    pub high: Option<i64>,
    pub high_time: Option<i64>,
    pub low: Option<i64>,
    pub low_time: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatestSnapshot {
    pub quotes: HashMap<i64, LatestQuote>,
}

/// Averaged prices and volumes of one item over one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuote {
    pub avg_high_price: Option<i64>,
    pub high_price_volume: Option<i64>,
    pub avg_low_price: Option<i64>,
    pub low_price_volume: Option<i64>,
}

impl WindowQuote {
    pub fn to_candle(self, item_id: i64, timestamp: i64) -> Candle {
        Candle {
            item_id,
            timestamp,
            avg_high_price: self.avg_high_price,
            high_price_volume: self.high_price_volume,
            avg_low_price: self.avg_low_price,
            low_price_volume: self.low_price_volume,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowSnapshot {
    /// Window the source actually served; may lag the one requested
    pub timestamp: Option<i64>,
    pub quotes: HashMap<i64, WindowQuote>,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<LatestSnapshot, FetchError>;

    async fn fetch_window(
        &self,
        granularity: Granularity,
        timestamp: i64,
    ) -> Result<WindowSnapshot, FetchError>;
}
