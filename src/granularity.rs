use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Feed granularity. `Latest` is the sub-minute instant feed, the others are
/// averaged candle windows stored in their own tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    Latest,
    FiveMinutes,
    OneHour,
    SixHours,
    TwentyFourHours,
}

impl Granularity {
    /// Candle granularities ordered fine to coarse.
    pub const CANDLES: [Granularity; 4] = [
        Granularity::FiveMinutes,
        Granularity::OneHour,
        Granularity::SixHours,
        Granularity::TwentyFourHours,
    ];

    /// Length of one window (or one polling period for `Latest`) in seconds
    pub fn period_secs(self) -> i64 {
        match self {
            Granularity::Latest => 60,
            Granularity::FiveMinutes => 300,
            Granularity::OneHour => 3_600,
            Granularity::SixHours => 21_600,
            Granularity::TwentyFourHours => 86_400,
        }
    }

    /// Candle table backing this granularity
    pub fn table(self) -> Option<&'static str> {
        match self {
            Granularity::Latest => None,
            Granularity::FiveMinutes => Some("prices_5m"),
            Granularity::OneHour => Some("prices_1h"),
            Granularity::SixHours => Some("prices_6h"),
            Granularity::TwentyFourHours => Some("prices_24h"),
        }
    }

    /// Logical retention window. Sized so every trend horizon reading from
    /// this table still finds its reference candle (including extended search).
    pub fn retention_secs(self) -> i64 {
        match self {
            Granularity::Latest => 0,
            Granularity::FiveMinutes => 86_400 + 300,
            Granularity::OneHour => 7 * 86_400 + 3_600,
            Granularity::SixHours => 30 * 86_400 + 21_600,
            Granularity::TwentyFourHours => 450 * 86_400,
        }
    }

    pub fn buffer_secs(self) -> i64 {
        self.period_secs()
    }

    /// Name of the lock a manual backfill holds for this granularity
    pub fn backfill_lock(self) -> String {
        format!("backfill_{}", self.label())
    }

    pub fn label(self) -> &'static str {
        match self {
            Granularity::Latest => "latest",
            Granularity::FiveMinutes => "5m",
            Granularity::OneHour => "1h",
            Granularity::SixHours => "6h",
            Granularity::TwentyFourHours => "24h",
        }
    }

    pub fn is_candle(self) -> bool {
        self != Granularity::Latest
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "latest" => Ok(Granularity::Latest),
            "5m" => Ok(Granularity::FiveMinutes),
            "1h" => Ok(Granularity::OneHour),
            "6h" => Ok(Granularity::SixHours),
            "24h" => Ok(Granularity::TwentyFourHours),
            other => Err(format!("unknown granularity '{}'", other)),
        }
    }
}
