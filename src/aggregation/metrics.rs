use crate::aggregation::trend::round2;
use crate::config::FeeConfig;
use crate::database::models::{Candle, CandleTotals, WindowStats};
use crate::granularity::Granularity;

/// Where the numbers for one stats window come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSource {
    /// The most recent candle of this granularity
    LatestCandle(Granularity),
    /// Sums of candles over a trailing span
    Totals { granularity: Granularity, span_secs: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatsWindow {
    FiveMinutes,
    OneHour,
    SixHours,
    TwentyFourHours,
    OneWeek,
    OneMonth,
}

impl StatsWindow {
    pub const COUNT: usize = 6;

    pub const ALL: [StatsWindow; StatsWindow::COUNT] = [
        StatsWindow::FiveMinutes,
        StatsWindow::OneHour,
        StatsWindow::SixHours,
        StatsWindow::TwentyFourHours,
        StatsWindow::OneWeek,
        StatsWindow::OneMonth,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn suffix(self) -> &'static str {
        match self {
            StatsWindow::FiveMinutes => "5m",
            StatsWindow::OneHour => "1h",
            StatsWindow::SixHours => "6h",
            StatsWindow::TwentyFourHours => "24h",
            StatsWindow::OneWeek => "1w",
            StatsWindow::OneMonth => "1m",
        }
    }

    pub fn source(self) -> StatsSource {
        match self {
            StatsWindow::FiveMinutes => StatsSource::LatestCandle(Granularity::FiveMinutes),
            StatsWindow::OneHour => StatsSource::LatestCandle(Granularity::OneHour),
            StatsWindow::SixHours => StatsSource::LatestCandle(Granularity::SixHours),
            StatsWindow::TwentyFourHours => StatsSource::LatestCandle(Granularity::TwentyFourHours),
            StatsWindow::OneWeek => StatsSource::Totals {
                granularity: Granularity::TwentyFourHours,
                span_secs: 7 * 86_400,
            },
            StatsWindow::OneMonth => StatsSource::Totals {
                granularity: Granularity::TwentyFourHours,
                span_secs: 30 * 86_400,
            },
        }
    }
}

/// Fee withheld when selling at `price`
pub fn sale_fee(price: i64, fees: &FeeConfig) -> i64 {
    let fee = (price as f64 * fees.rate).floor() as i64;
    fee.min(fees.cap).max(0)
}

/// Flip metrics derived from the current high/low pair
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceMetrics {
    pub margin: Option<i64>,
    pub roi: Option<f64>,
    pub spread: Option<i64>,
    pub max_profit: Option<i64>,
    pub max_investment: Option<i64>,
}

impl PriceMetrics {
    /// Buy at `low`, sell at `high` after the fee
    pub fn compute(high: Option<i64>, low: Option<i64>, buy_limit: Option<i64>, fees: &FeeConfig) -> Self {
        let (Some(high), Some(low)) = (high, low) else {
            return Self {
                max_investment: low.zip(buy_limit).map(|(l, limit)| l.saturating_mul(limit)),
                ..Self::default()
            };
        };

        let spread = high - low;
        let margin = spread - sale_fee(high, fees);
        let roi = (low != 0).then(|| round2(margin as f64 / low as f64 * 100.0));

        Self {
            margin: Some(margin),
            roi,
            spread: Some(spread),
            max_profit: buy_limit.map(|limit| margin.saturating_mul(limit)),
            max_investment: buy_limit.map(|limit| low.saturating_mul(limit)),
        }
    }
}

pub fn buy_sell_rate(high_volume: i64, low_volume: i64) -> Option<f64> {
    if low_volume == 0 {
        return None;
    }
    Some(round2(high_volume as f64 / low_volume as f64))
}

pub fn stats_from_candle(candle: &Candle) -> WindowStats {
    let Some(volume) = candle.total_volume() else {
        return WindowStats::default();
    };
    let high_volume = candle.high_price_volume.unwrap_or(0);
    let low_volume = candle.low_price_volume.unwrap_or(0);
    let turnover = candle.avg_high_price.unwrap_or(0) as f64 * high_volume as f64
        + candle.avg_low_price.unwrap_or(0) as f64 * low_volume as f64;

    WindowStats {
        volume: Some(volume),
        turnover: Some(turnover.round() as i64),
        buy_sell_rate: buy_sell_rate(high_volume, low_volume),
    }
}

pub fn stats_from_totals(totals: &CandleTotals) -> WindowStats {
    WindowStats {
        volume: Some(totals.high_volume + totals.low_volume),
        turnover: Some((totals.high_turnover + totals.low_turnover).round() as i64),
        buy_sell_rate: buy_sell_rate(totals.high_volume, totals.low_volume),
    }
}
