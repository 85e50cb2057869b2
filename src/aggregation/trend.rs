//! Multi-horizon trend: percentage change between the latest priced candle
//! and the candle nearest to one horizon period earlier.
use crate::database::models::{Candle, CandleWindow};
use crate::granularity::Granularity;

/// Share of the period used as tolerance by the extended search
const EXTENDED_SEARCH_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonSpec {
    pub source: Granularity,
    pub period: i64,
    pub tolerance: i64,
    /// Fallback tolerance for sparse coarse history
    pub extended_tolerance: Option<i64>,
}

impl HorizonSpec {
    pub fn new(source: Granularity, period: i64, tolerance: i64) -> Self {
        Self {
            source,
            period,
            tolerance,
            extended_tolerance: None,
        }
    }

    pub fn with_extended_search(mut self) -> Self {
        self.extended_tolerance = Some((self.period as f64 * EXTENDED_SEARCH_FRACTION) as i64);
        self
    }

    pub fn target(&self, latest_timestamp: i64) -> i64 {
        latest_timestamp - self.period
    }

    pub fn search_window(&self, item_id: i64, latest_timestamp: i64) -> CandleWindow {
        window_around(item_id, self.target(latest_timestamp), self.tolerance)
    }

    pub fn extended_window(&self, item_id: i64, latest_timestamp: i64) -> Option<CandleWindow> {
        self.extended_tolerance
            .map(|t| window_around(item_id, self.target(latest_timestamp), t))
    }
}

fn window_around(item_id: i64, target: i64, tolerance: i64) -> CandleWindow {
    CandleWindow {
        item_id,
        from: target - tolerance,
        to: target + tolerance,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrendHorizon {
    FiveMinutes,
    OneHour,
    SixHours,
    TwentyFourHours,
    OneWeek,
    OneMonth,
    ThreeMonths,
    OneYear,
}

impl TrendHorizon {
    pub const COUNT: usize = 8;

    pub const ALL: [TrendHorizon; TrendHorizon::COUNT] = [
        TrendHorizon::FiveMinutes,
        TrendHorizon::OneHour,
        TrendHorizon::SixHours,
        TrendHorizon::TwentyFourHours,
        TrendHorizon::OneWeek,
        TrendHorizon::OneMonth,
        TrendHorizon::ThreeMonths,
        TrendHorizon::OneYear,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Column suffix, e.g. `trend_1h`
    pub fn suffix(self) -> &'static str {
        match self {
            TrendHorizon::FiveMinutes => "5m",
            TrendHorizon::OneHour => "1h",
            TrendHorizon::SixHours => "6h",
            TrendHorizon::TwentyFourHours => "24h",
            TrendHorizon::OneWeek => "1w",
            TrendHorizon::OneMonth => "1m",
            TrendHorizon::ThreeMonths => "3m",
            TrendHorizon::OneYear => "1y",
        }
    }

    pub fn spec(self) -> HorizonSpec {
        const DAY: i64 = 86_400;
        match self {
            TrendHorizon::FiveMinutes => HorizonSpec::new(Granularity::FiveMinutes, 300, 150),
            TrendHorizon::OneHour => HorizonSpec::new(Granularity::FiveMinutes, 3_600, 300),
            TrendHorizon::SixHours => HorizonSpec::new(Granularity::FiveMinutes, 21_600, 900),
            TrendHorizon::TwentyFourHours => HorizonSpec::new(Granularity::OneHour, DAY, 3_600),
            TrendHorizon::OneWeek => {
                HorizonSpec::new(Granularity::SixHours, 7 * DAY, 21_600).with_extended_search()
            }
            TrendHorizon::OneMonth => {
                HorizonSpec::new(Granularity::TwentyFourHours, 30 * DAY, DAY).with_extended_search()
            }
            TrendHorizon::ThreeMonths => {
                HorizonSpec::new(Granularity::TwentyFourHours, 90 * DAY, DAY).with_extended_search()
            }
            TrendHorizon::OneYear => {
                HorizonSpec::new(Granularity::TwentyFourHours, 365 * DAY, 2 * DAY)
                    .with_extended_search()
            }
        }
    }
}

/// Most recent candle with a defined mid at or before `now`
pub fn select_latest<'a, I>(candles: I, now: i64) -> Option<&'a Candle>
where
    I: IntoIterator<Item = &'a Candle>,
{
    candles
        .into_iter()
        .filter(|c| c.timestamp <= now && c.mid().is_some())
        .max_by_key(|c| c.timestamp)
}

/// Priced candle nearest to `target` within `tolerance`. Ties go to rows with
/// both sides present, then to the earlier row.
pub fn select_reference<'a, I>(candles: I, target: i64, tolerance: i64) -> Option<&'a Candle>
where
    I: IntoIterator<Item = &'a Candle>,
{
    candles
        .into_iter()
        .filter(|c| c.mid().is_some() && (c.timestamp - target).abs() <= tolerance)
        .min_by_key(|c| ((c.timestamp - target).abs(), !c.is_complete(), c.timestamp))
}

/// Percentage change rounded to two decimals; undefined for a zero reference
pub fn trend_percent(latest: &Candle, reference: &Candle) -> Option<f64> {
    let latest_mid = latest.mid()?;
    let reference_mid = reference.mid()?;
    if reference_mid == 0.0 {
        return None;
    }
    Some(round2(100.0 * (latest_mid - reference_mid) / reference_mid))
}

/// Full trend computation over one item's in-memory history
pub fn compute_trend(spec: &HorizonSpec, history: &[Candle], now: i64) -> Option<f64> {
    let latest = select_latest(history, now)?;
    let target = spec.target(latest.timestamp);

    let reference = select_reference(history, target, spec.tolerance).or_else(|| {
        spec.extended_tolerance
            .and_then(|extended| select_reference(history, target, extended))
    })?;

    trend_percent(latest, reference)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced(timestamp: i64, high: Option<i64>, low: Option<i64>) -> Candle {
        Candle {
            avg_high_price: high,
            avg_low_price: low,
            ..Candle::empty(7, timestamp)
        }
    }

    fn hourly() -> HorizonSpec {
        HorizonSpec::new(Granularity::FiveMinutes, 3_600, 300)
    }

    #[test]
    fn one_hour_trend_within_tolerance() {
        for offset in [-300, 0, 300] {
            let history = [priced(0, Some(100), Some(100)), priced(3_600 + offset, Some(110), Some(110))];
            assert_eq!(compute_trend(&hourly(), &history, 10_000), Some(10.0), "offset {}", offset);
        }
    }

    #[test]
    fn no_reference_within_tolerance_is_none_not_zero() {
        let history = [priced(0, Some(100), None), priced(3_901, Some(110), None)];
        assert_eq!(compute_trend(&hourly(), &history, 10_000), None);
    }

    #[test]
    fn latest_ignores_future_and_unpriced_rows() {
        let history = [
            priced(0, Some(100), None),
            priced(3_600, Some(120), None),
            Candle::empty(7, 3_900),
            priced(99_999, Some(500), None),
        ];
        let latest = select_latest(&history, 10_000).unwrap();
        assert_eq!(latest.timestamp, 3_600);
        assert_eq!(compute_trend(&hourly(), &history, 10_000), Some(20.0));
    }

    #[test]
    fn reference_prefers_nearest_then_complete() {
        let history = [
            priced(900, Some(10), None),
            priced(1_100, Some(20), Some(20)),
            priced(1_050, Some(30), None),
        ];
        // 1_050 is nearest to 1_000 on its own
        assert_eq!(select_reference(&history, 1_000, 300).unwrap().timestamp, 1_050);

        let tied = [priced(900, Some(10), None), priced(1_100, Some(20), Some(20))];
        assert_eq!(select_reference(&tied, 1_000, 300).unwrap().timestamp, 1_100);
    }

    #[test]
    fn extended_search_only_for_long_horizons() {
        let week = TrendHorizon::OneWeek.spec();
        assert_eq!(week.extended_tolerance, Some(120_960));
        assert!(TrendHorizon::OneHour.spec().extended_tolerance.is_none());

        let latest_ts = 10 * 86_400;
        let target = latest_ts - week.period;
        // One day off target: outside the 6h tolerance, inside the 20% window
        let history = [
            priced(target - 86_400, Some(80), None),
            priced(latest_ts, Some(100), None),
        ];
        assert_eq!(compute_trend(&week, &history, latest_ts), Some(25.0));

        let strict = HorizonSpec::new(Granularity::SixHours, week.period, week.tolerance);
        assert_eq!(compute_trend(&strict, &history, latest_ts), None);
    }

    #[test]
    fn zero_reference_mid_is_undefined() {
        let history = [priced(0, Some(0), Some(0)), priced(3_600, Some(5), Some(5))];
        assert_eq!(compute_trend(&hourly(), &history, 3_600), None);
    }

    #[test]
    fn rounds_to_two_decimals() {
        let history = [priced(0, Some(300), None), priced(3_600, Some(301), None)];
        assert_eq!(compute_trend(&hourly(), &history, 3_600), Some(0.33));
        assert_eq!(round2(-1.005_1), -1.01);
    }
}
