// src/config.rs
use crate::granularity::Granularity;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/price-aggregator";
const ENV_PREFIX: &str = "PRICE_AGGREGATOR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    pub scheduler: SchedulerConfig,
    pub aggregation: AggregationConfig,
    pub retention: RetentionConfig,
    pub fees: FeeConfig,
    pub locks: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
    /// Server-side statement timeout, the backstop for stuck transactions
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        // Legacy variable names are still honoured as defaults
        Self {
            host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            user: std::env::var("DB_USER").unwrap_or_else(|_| "prices".to_string()),
            password: std::env::var("DB_PASSWORD").unwrap_or_else(|_| "prices".to_string()),
            name: std::env::var("DB_NAME").unwrap_or_else(|_| "prices".to_string()),
            max_connections: 10,
            statement_timeout_secs: 60,
        }
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://prices.runescape.wiki/api/v1/osrs".to_string(),
            user_agent: "price-aggregator/0.1".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub latest_period_secs: i64,
    /// Period of the fastest candle feed; its boundaries drive the whole chain
    pub candle_period_secs: i64,
    pub retry_attempts: usize,
    pub retry_delay_secs: u64,
    /// Attempts allowed for a latest snapshot with nothing new in it
    pub no_change_attempts: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            latest_period_secs: Granularity::Latest.period_secs(),
            candle_period_secs: Granularity::FiveMinutes.period_secs(),
            retry_attempts: 10,
            retry_delay_secs: 5,
            no_change_attempts: 3,
            shutdown_grace_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Upper bound on markers consumed by one run under heavy backlog
    pub max_markers_per_run: usize,
    pub relaxed_interval_secs: u64,
    pub floor_interval_secs: u64,
    /// Queue depth that halves the relaxed interval
    pub backlog_step: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            concurrency: num_cpus::get().clamp(1, 4),
            max_markers_per_run: 20_000,
            relaxed_interval_secs: 60,
            floor_interval_secs: 5,
            backlog_step: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub log_retention_secs: i64,
    pub instant_retention_secs: i64,
    /// Rows always kept regardless of age
    pub keep_recent: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            log_retention_secs: 86_400,
            instant_retention_secs: 90 * 86_400,
            keep_recent: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Fraction of the sale price withheld on every sale
    pub rate: f64,
    pub cap: i64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            rate: 0.02,
            cap: 5_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub dir: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("price-aggregator-locks"),
        }
    }
}

impl AppConfig {
    /// Load defaults, then the optional config file, then environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var(format!("{}_CONFIG", ENV_PREFIX))
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.latest_period_secs <= 0 || s.candle_period_secs <= 0 {
            bail!("scheduler periods must be positive");
        }
        for g in Granularity::CANDLES {
            if g.period_secs() % s.candle_period_secs != 0 {
                bail!(
                    "candle period {}s does not divide the {} period",
                    s.candle_period_secs,
                    g
                );
            }
        }
        if s.retry_attempts == 0 || s.no_change_attempts == 0 {
            bail!("retry attempt counts must be at least 1");
        }

        let a = &self.aggregation;
        if a.batch_size == 0 || a.concurrency == 0 || a.max_markers_per_run == 0 {
            bail!("aggregation batch size, concurrency and run limit must be non-zero");
        }
        if a.floor_interval_secs == 0 || a.floor_interval_secs > a.relaxed_interval_secs {
            bail!("aggregation floor interval must be in 1..=relaxed interval");
        }

        if !(0.0..1.0).contains(&self.fees.rate) {
            bail!("fee rate must be within [0, 1)");
        }
        if self.retention.keep_recent < 0 {
            bail!("retention.keep_recent must not be negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.candle_period_secs, 300);
        assert!(config.aggregation.concurrency >= 1 && config.aggregation.concurrency <= 4);
    }

    #[test]
    fn rejects_candle_period_that_misaligns_coarser_feeds() {
        let mut config = AppConfig::default();
        config.scheduler.candle_period_secs = 420;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_floor_above_relaxed_interval() {
        let mut config = AppConfig::default();
        config.aggregation.floor_interval_secs = 120;
        assert!(config.validate().is_err());
    }
}
