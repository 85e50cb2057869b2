// SQL schema definitions. Candle and canonical tables are generated because
// their shape follows the granularity and horizon tables in code.
use crate::aggregation::metrics::StatsWindow;
use crate::aggregation::trend::TrendHorizon;

pub const CREATE_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    item_id BIGINT PRIMARY KEY,
    name VARCHAR NOT NULL,
    tradeable BOOLEAN NOT NULL DEFAULT TRUE,
    buy_limit BIGINT,
    value BIGINT,
    high_alch BIGINT,
    low_alch BIGINT
);
"#;

pub const CREATE_PRICE_INSTANTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS price_instants (
    item_id BIGINT NOT NULL,
    side VARCHAR NOT NULL,
    price BIGINT NOT NULL,
    source_time BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (item_id, side)
);
"#;

pub const CREATE_PRICE_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS price_instant_log (
    id BIGSERIAL PRIMARY KEY,
    item_id BIGINT NOT NULL,
    side VARCHAR NOT NULL,
    price BIGINT NOT NULL,
    source_time BIGINT NOT NULL,
    observed_at TIMESTAMPTZ NOT NULL
);
"#;

pub const CREATE_DIRTY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dirty_items (
    item_id BIGINT PRIMARY KEY,
    touched_at TIMESTAMPTZ NOT NULL
);
"#;

pub const CREATE_INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_price_instant_log_observed ON price_instant_log(observed_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_price_instants_updated ON price_instants(updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_dirty_items_touched ON dirty_items(touched_at)",
];

pub fn create_candle_table(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    item_id BIGINT NOT NULL,
    timestamp BIGINT NOT NULL,
    avg_high_price BIGINT,
    high_price_volume BIGINT,
    avg_low_price BIGINT,
    low_price_volume BIGINT,
    total_volume BIGINT GENERATED ALWAYS AS
        (COALESCE(high_price_volume, 0) + COALESCE(low_price_volume, 0)) STORED,
    UNIQUE (item_id, timestamp)
);
"#
    )
}

pub fn create_candle_time_index(table: &str) -> String {
    format!("CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp DESC)")
}

/// Integer-time hypertable for a candle table when TimescaleDB is present
pub fn create_candle_hypertable(table: &str, chunk_secs: i64) -> String {
    format!(
        "SELECT create_hypertable('{table}', 'timestamp', chunk_time_interval => {chunk_secs}::BIGINT, if_not_exists => TRUE, migrate_data => TRUE)"
    )
}

/// Identity, price and metric columns of `canonical_items`, in insert order
pub fn canonical_columns() -> Vec<String> {
    let mut columns: Vec<String> = [
        "item_id",
        "name",
        "tradeable",
        "buy_limit",
        "value",
        "high_alch",
        "low_alch",
        "high",
        "high_time",
        "low",
        "low_time",
        "margin",
        "roi",
        "spread",
        "max_profit",
        "max_investment",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();

    for window in StatsWindow::ALL {
        columns.push(format!("volume_{}", window.suffix()));
        columns.push(format!("turnover_{}", window.suffix()));
        columns.push(format!("buy_sell_rate_{}", window.suffix()));
    }
    for horizon in TrendHorizon::ALL {
        columns.push(format!("trend_{}", horizon.suffix()));
    }
    columns.push("timestamp_updated".to_string());
    columns
}

pub fn create_canonical_table() -> String {
    let mut ddl = String::from(
        "CREATE TABLE IF NOT EXISTS canonical_items (
    item_id BIGINT PRIMARY KEY,
    name VARCHAR NOT NULL,
    tradeable BOOLEAN NOT NULL,
    buy_limit BIGINT,
    value BIGINT,
    high_alch BIGINT,
    low_alch BIGINT,
    high BIGINT,
    high_time BIGINT,
    low BIGINT,
    low_time BIGINT,
    margin BIGINT,
    roi DOUBLE PRECISION,
    spread BIGINT,
    max_profit BIGINT,
    max_investment BIGINT,
",
    );
    for window in StatsWindow::ALL {
        let s = window.suffix();
        ddl.push_str(&format!(
            "    volume_{s} BIGINT,\n    turnover_{s} BIGINT,\n    buy_sell_rate_{s} DOUBLE PRECISION,\n"
        ));
    }
    for horizon in TrendHorizon::ALL {
        ddl.push_str(&format!("    trend_{} DOUBLE PRECISION,\n", horizon.suffix()));
    }
    ddl.push_str("    timestamp_updated TIMESTAMPTZ NOT NULL\n)");
    ddl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ddl_declares_every_insert_column() {
        let ddl = create_canonical_table();
        for column in canonical_columns() {
            assert!(ddl.contains(&format!("    {} ", column)), "missing {}", column);
        }
        assert_eq!(
            canonical_columns().len(),
            16 + 3 * StatsWindow::COUNT + TrendHorizon::COUNT + 1
        );
    }
}
