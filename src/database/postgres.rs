use crate::aggregation::metrics::StatsWindow;
use crate::aggregation::trend::TrendHorizon;
use crate::config::DatabaseConfig;
use crate::database::models::{
    CanonicalRecord, Candle, CandleTotals, CandleWindow, DirtyMarker, Item, PriceChange,
    PriceInstant, Side, WindowStats,
};
use crate::database::schema;
use crate::database::store::{PriceStore, StoreResult};
use crate::error::StoreError;
use crate::granularity::Granularity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::{debug, info};

/// Rows per multi-row candle statement
const CANDLE_CHUNK: usize = 1_000;
/// Canonical rows carry ~43 binds each; stay well under the 65535 bind limit
const CANONICAL_CHUNK: usize = 500;

const CANDLE_COLUMNS: &str =
    "item_id, timestamp, avg_high_price, high_price_volume, avg_low_price, low_price_volume";

const PRICED: &str = "(avg_high_price IS NOT NULL OR avg_low_price IS NOT NULL)";

pub struct PostgresManager {
    pool: PgPool,
}

impl PostgresManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.connection_string())
            .context("Invalid database connection settings")?
            .options([(
                "statement_timeout",
                format!("{}s", config.statement_timeout_secs),
            )]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        info!(
            "Connected to PostgreSQL at {}:{}/{} (max {} connections)",
            config.host, config.port, config.name, config.max_connections
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Create tables if they don't exist
    pub async fn init_tables(&self) -> Result<()> {
        for ddl in [
            schema::CREATE_ITEMS_TABLE,
            schema::CREATE_PRICE_INSTANTS_TABLE,
            schema::CREATE_PRICE_LOG_TABLE,
            schema::CREATE_DIRTY_TABLE,
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        for granularity in Granularity::CANDLES {
            let table = candle_table(granularity)?;
            sqlx::query(&schema::create_candle_table(table))
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {}", table))?;
        }

        sqlx::query(&schema::create_canonical_table())
            .execute(&self.pool)
            .await
            .context("Failed to create canonical_items")?;

        if self.timescale_available().await? {
            for granularity in Granularity::CANDLES {
                let table = candle_table(granularity)?;
                let chunk_secs = hypertable_chunk_secs(granularity);
                let res = sqlx::query(&schema::create_candle_hypertable(table, chunk_secs))
                    .execute(&self.pool)
                    .await;

                if let Err(e) = res {
                    // Re-running init against an existing hypertable is fine
                    if !e.to_string().contains("already") {
                        return Err(e).with_context(|| format!("Failed to convert {} to a hypertable", table));
                    }
                }
            }
        } else {
            info!("TimescaleDB extension not available, skipping hypertable creation");
        }

        for index in schema::CREATE_INDICES {
            sqlx::query(index).execute(&self.pool).await?;
        }
        for granularity in Granularity::CANDLES {
            sqlx::query(&schema::create_candle_time_index(candle_table(granularity)?))
                .execute(&self.pool)
                .await?;
        }

        info!("Database tables initialized successfully");
        Ok(())
    }

    async fn timescale_available(&self) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) FROM pg_extension WHERE extname = 'timescaledb'")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }
}

fn candle_table(granularity: Granularity) -> StoreResult<&'static str> {
    granularity
        .table()
        .ok_or_else(|| StoreError::Rejected(format!("{} has no candle table", granularity)))
}

fn hypertable_chunk_secs(granularity: Granularity) -> i64 {
    match granularity {
        Granularity::FiveMinutes => 86_400,
        Granularity::OneHour => 7 * 86_400,
        Granularity::SixHours => 30 * 86_400,
        _ => 365 * 86_400,
    }
}

fn instant_from_row(row: &PgRow) -> Result<PriceInstant, sqlx::Error> {
    let side: String = row.try_get("side")?;
    Ok(PriceInstant {
        item_id: row.try_get("item_id")?,
        side: side.parse::<Side>().map_err(|e| sqlx::Error::Decode(e.into()))?,
        price: row.try_get("price")?,
        source_time: row.try_get("source_time")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn canonical_from_row(row: &PgRow) -> Result<CanonicalRecord, sqlx::Error> {
    let mut window_stats = [WindowStats::default(); StatsWindow::COUNT];
    for window in StatsWindow::ALL {
        let s = window.suffix();
        window_stats[window.index()] = WindowStats {
            volume: row.try_get(format!("volume_{}", s).as_str())?,
            turnover: row.try_get(format!("turnover_{}", s).as_str())?,
            buy_sell_rate: row.try_get(format!("buy_sell_rate_{}", s).as_str())?,
        };
    }

    let mut trends = [None; TrendHorizon::COUNT];
    for horizon in TrendHorizon::ALL {
        trends[horizon.index()] = row.try_get(format!("trend_{}", horizon.suffix()).as_str())?;
    }

    Ok(CanonicalRecord {
        item_id: row.try_get("item_id")?,
        name: row.try_get("name")?,
        tradeable: row.try_get("tradeable")?,
        buy_limit: row.try_get("buy_limit")?,
        value: row.try_get("value")?,
        high_alch: row.try_get("high_alch")?,
        low_alch: row.try_get("low_alch")?,
        high: row.try_get("high")?,
        high_time: row.try_get("high_time")?,
        low: row.try_get("low")?,
        low_time: row.try_get("low_time")?,
        margin: row.try_get("margin")?,
        roi: row.try_get("roi")?,
        spread: row.try_get("spread")?,
        max_profit: row.try_get("max_profit")?,
        max_investment: row.try_get("max_investment")?,
        window_stats,
        trends,
        timestamp_updated: row.try_get("timestamp_updated")?,
    })
}

/// Bind one canonical record in `schema::canonical_columns()` order
fn push_canonical(mut b: sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>, r: &CanonicalRecord) {
    b.push_bind(r.item_id)
        .push_bind(r.name.clone())
        .push_bind(r.tradeable)
        .push_bind(r.buy_limit)
        .push_bind(r.value)
        .push_bind(r.high_alch)
        .push_bind(r.low_alch)
        .push_bind(r.high)
        .push_bind(r.high_time)
        .push_bind(r.low)
        .push_bind(r.low_time)
        .push_bind(r.margin)
        .push_bind(r.roi)
        .push_bind(r.spread)
        .push_bind(r.max_profit)
        .push_bind(r.max_investment);
    for stats in &r.window_stats {
        b.push_bind(stats.volume)
            .push_bind(stats.turnover)
            .push_bind(stats.buy_sell_rate);
    }
    for trend in &r.trends {
        b.push_bind(*trend);
    }
    b.push_bind(r.timestamp_updated);
}

#[async_trait]
impl PriceStore for PostgresManager {
    async fn items(&self) -> StoreResult<Vec<Item>> {
        let items = sqlx::query_as::<_, Item>(
            "SELECT item_id, name, tradeable, buy_limit, value, high_alch, low_alch
            FROM items
            ORDER BY item_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn items_by_id(&self, ids: &[i64]) -> StoreResult<Vec<Item>> {
        let items = sqlx::query_as::<_, Item>(
            "SELECT item_id, name, tradeable, buy_limit, value, high_alch, low_alch
            FROM items
            WHERE item_id = ANY($1)",
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn price_instants(&self) -> StoreResult<Vec<PriceInstant>> {
        let rows = sqlx::query(
            "SELECT item_id, side, price, source_time, updated_at FROM price_instants",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(instant_from_row).collect::<Result<_, _>>()?)
    }

    async fn price_instants_for(&self, ids: &[i64]) -> StoreResult<Vec<PriceInstant>> {
        let rows = sqlx::query(
            "SELECT item_id, side, price, source_time, updated_at
            FROM price_instants
            WHERE item_id = ANY($1)",
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(instant_from_row).collect::<Result<_, _>>()?)
    }

    async fn apply_price_changes(
        &self,
        changes: &[PriceChange],
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        // ON CONFLICT cannot touch the same key twice in one statement
        let mut latest: BTreeMap<(i64, Side), PriceChange> = BTreeMap::new();
        for change in changes {
            latest.insert((change.item_id, change.side), *change);
        }
        let deduped: Vec<PriceChange> = latest.into_values().collect();
        let mut item_ids: Vec<i64> = deduped.iter().map(|c| c.item_id).collect();
        item_ids.dedup();

        let mut tx = self.pool.begin().await?;

        for chunk in deduped.chunks(CANDLE_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO price_instants (item_id, side, price, source_time, updated_at) ",
            );
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(c.item_id)
                    .push_bind(c.side.as_str())
                    .push_bind(c.price)
                    .push_bind(c.source_time)
                    .push_bind(observed_at);
            });
            qb.push(
                " ON CONFLICT (item_id, side) DO UPDATE SET
                    price = EXCLUDED.price,
                    source_time = EXCLUDED.source_time,
                    updated_at = EXCLUDED.updated_at",
            );
            qb.build().execute(&mut *tx).await?;

            let mut log: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO price_instant_log (item_id, side, price, source_time, observed_at) ",
            );
            log.push_values(chunk, |mut b, c| {
                b.push_bind(c.item_id)
                    .push_bind(c.side.as_str())
                    .push_bind(c.price)
                    .push_bind(c.source_time)
                    .push_bind(observed_at);
            });
            log.build().execute(&mut *tx).await?;
        }

        for chunk in item_ids.chunks(CANDLE_CHUNK) {
            let mut dirty: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO dirty_items (item_id, touched_at) ");
            dirty.push_values(chunk, |mut b, id| {
                b.push_bind(*id).push_bind(observed_at);
            });
            dirty.push(
                " ON CONFLICT (item_id) DO UPDATE SET
                    touched_at = GREATEST(dirty_items.touched_at, EXCLUDED.touched_at)",
            );
            dirty.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(
            "Applied {} price changes across {} items",
            deduped.len(),
            item_ids.len()
        );
        Ok(())
    }

    async fn window_row_count(&self, granularity: Granularity, timestamp: i64) -> StoreResult<usize> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(DISTINCT item_id) FROM {} WHERE timestamp = $1",
            candle_table(granularity)?
        ))
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as usize)
    }

    async fn upsert_candles(&self, granularity: Granularity, candles: &[Candle]) -> StoreResult<u64> {
        if candles.is_empty() {
            return Ok(0);
        }
        let table = candle_table(granularity)?;

        let mut by_key: BTreeMap<(i64, i64), Candle> = BTreeMap::new();
        for candle in candles {
            by_key.insert((candle.item_id, candle.timestamp), *candle);
        }
        let rows: Vec<Candle> = by_key.into_values().collect();

        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for chunk in rows.chunks(CANDLE_CHUNK) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, CANDLE_COLUMNS));
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(c.item_id)
                    .push_bind(c.timestamp)
                    .push_bind(c.avg_high_price)
                    .push_bind(c.high_price_volume)
                    .push_bind(c.avg_low_price)
                    .push_bind(c.low_price_volume);
            });
            // Skip identical rows, and never let a partial row replace a complete one
            qb.push(format!(
                " ON CONFLICT (item_id, timestamp) DO UPDATE SET
                    avg_high_price = EXCLUDED.avg_high_price,
                    high_price_volume = EXCLUDED.high_price_volume,
                    avg_low_price = EXCLUDED.avg_low_price,
                    low_price_volume = EXCLUDED.low_price_volume
                WHERE ({t}.avg_high_price, {t}.high_price_volume, {t}.avg_low_price, {t}.low_price_volume)
                    IS DISTINCT FROM
                    (EXCLUDED.avg_high_price, EXCLUDED.high_price_volume, EXCLUDED.avg_low_price, EXCLUDED.low_price_volume)
                  AND ({t}.avg_high_price IS NULL OR {t}.avg_low_price IS NULL
                    OR (EXCLUDED.avg_high_price IS NOT NULL AND EXCLUDED.avg_low_price IS NOT NULL))",
                t = table
            ));
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn latest_candles(
        &self,
        granularity: Granularity,
        ids: &[i64],
        at: i64,
    ) -> StoreResult<HashMap<i64, Candle>> {
        let candles = sqlx::query_as::<_, Candle>(&format!(
            "SELECT DISTINCT ON (item_id) {}
            FROM {}
            WHERE item_id = ANY($1) AND timestamp <= $2
            ORDER BY item_id, timestamp DESC",
            CANDLE_COLUMNS,
            candle_table(granularity)?
        ))
        .bind(ids.to_vec())
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(candles.into_iter().map(|c| (c.item_id, c)).collect())
    }

    async fn latest_priced_candles(
        &self,
        granularity: Granularity,
        ids: &[i64],
        at: i64,
    ) -> StoreResult<HashMap<i64, Candle>> {
        let candles = sqlx::query_as::<_, Candle>(&format!(
            "SELECT DISTINCT ON (item_id) {}
            FROM {}
            WHERE item_id = ANY($1) AND timestamp <= $2 AND {}
            ORDER BY item_id, timestamp DESC",
            CANDLE_COLUMNS,
            candle_table(granularity)?,
            PRICED
        ))
        .bind(ids.to_vec())
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(candles.into_iter().map(|c| (c.item_id, c)).collect())
    }

    async fn priced_candles_in_windows(
        &self,
        granularity: Granularity,
        windows: &[CandleWindow],
    ) -> StoreResult<Vec<Candle>> {
        if windows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = windows.iter().map(|w| w.item_id).collect();
        let lows: Vec<i64> = windows.iter().map(|w| w.from).collect();
        let highs: Vec<i64> = windows.iter().map(|w| w.to).collect();

        let candles = sqlx::query_as::<_, Candle>(&format!(
            "SELECT c.item_id, c.timestamp, c.avg_high_price, c.high_price_volume,
                    c.avg_low_price, c.low_price_volume
            FROM {} c
            JOIN unnest($1::bigint[], $2::bigint[], $3::bigint[]) AS w(item_id, lo, hi)
              ON c.item_id = w.item_id AND c.timestamp BETWEEN w.lo AND w.hi
            WHERE (c.avg_high_price IS NOT NULL OR c.avg_low_price IS NOT NULL)",
            candle_table(granularity)?
        ))
        .bind(ids)
        .bind(lows)
        .bind(highs)
        .fetch_all(&self.pool)
        .await?;
        Ok(candles)
    }

    async fn candle_totals(
        &self,
        granularity: Granularity,
        ids: &[i64],
        since: i64,
        until: i64,
    ) -> StoreResult<HashMap<i64, CandleTotals>> {
        let rows = sqlx::query(&format!(
            "SELECT item_id,
                    COALESCE(SUM(high_price_volume), 0)::BIGINT AS high_volume,
                    COALESCE(SUM(low_price_volume), 0)::BIGINT AS low_volume,
                    COALESCE(SUM(avg_high_price::float8 * high_price_volume), 0)::float8 AS high_turnover,
                    COALESCE(SUM(avg_low_price::float8 * low_price_volume), 0)::float8 AS low_turnover
            FROM {}
            WHERE item_id = ANY($1) AND timestamp > $2 AND timestamp <= $3
            GROUP BY item_id",
            candle_table(granularity)?
        ))
        .bind(ids.to_vec())
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        let mut totals = HashMap::with_capacity(rows.len());
        for row in rows {
            totals.insert(
                row.try_get::<i64, _>("item_id")?,
                CandleTotals {
                    high_volume: row.try_get("high_volume")?,
                    low_volume: row.try_get("low_volume")?,
                    high_turnover: row.try_get("high_turnover")?,
                    low_turnover: row.try_get("low_turnover")?,
                },
            );
        }
        Ok(totals)
    }

    async fn latest_candle_timestamp(&self, granularity: Granularity) -> StoreResult<Option<i64>> {
        let row = sqlx::query(&format!("SELECT MAX(timestamp) FROM {}", candle_table(granularity)?))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn delete_candles_before(&self, granularity: Granularity, cutoff: i64) -> StoreResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE timestamp < $1",
            candle_table(granularity)?
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn dirty_count(&self) -> StoreResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) FROM dirty_items")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as usize)
    }

    async fn dirty_markers(&self, limit: usize) -> StoreResult<Vec<DirtyMarker>> {
        let rows = sqlx::query(
            "SELECT item_id, touched_at FROM dirty_items
            ORDER BY touched_at, item_id
            LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut markers = Vec::with_capacity(rows.len());
        for row in rows {
            markers.push(DirtyMarker {
                item_id: row.try_get("item_id")?,
                touched_at: row.try_get("touched_at")?,
            });
        }
        Ok(markers)
    }

    async fn commit_canonical(
        &self,
        records: &[CanonicalRecord],
        processed: &[DirtyMarker],
    ) -> StoreResult<()> {
        let columns = schema::canonical_columns();
        let assignments = columns
            .iter()
            .filter(|c| c.as_str() != "item_id")
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(CANONICAL_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO canonical_items ({}) ",
                columns.join(", ")
            ));
            qb.push_values(chunk, |b, record| push_canonical(b, record));
            // A slower batch must not overwrite a row another batch already advanced
            qb.push(format!(
                " ON CONFLICT (item_id) DO UPDATE SET {}
                WHERE canonical_items.timestamp_updated <= EXCLUDED.timestamp_updated",
                assignments
            ));
            qb.build().execute(&mut *tx).await?;
        }

        if !processed.is_empty() {
            let ids: Vec<i64> = processed.iter().map(|m| m.item_id).collect();
            let touched: Vec<DateTime<Utc>> = processed.iter().map(|m| m.touched_at).collect();
            sqlx::query(
                "DELETE FROM dirty_items d
                USING unnest($1::bigint[], $2::timestamptz[]) AS p(item_id, touched_at)
                WHERE d.item_id = p.item_id AND d.touched_at <= p.touched_at",
            )
            .bind(ids)
            .bind(touched)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn canonical(&self, item_id: i64) -> StoreResult<Option<CanonicalRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM canonical_items WHERE item_id = $1",
            schema::canonical_columns().join(", ")
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(canonical_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn latest_log_observed_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(observed_at) FROM price_instant_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn prune_price_log(&self, cutoff: DateTime<Utc>, keep: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM price_instant_log
            WHERE observed_at < $1
              AND id NOT IN (
                SELECT id FROM price_instant_log
                ORDER BY observed_at DESC, id DESC
                LIMIT $2
              )",
        )
        .bind(cutoff)
        .bind(keep.max(0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn latest_instant_update(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(updated_at) FROM price_instants")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn prune_price_instants(&self, cutoff: DateTime<Utc>, keep: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM price_instants p
            WHERE p.updated_at < $1
              AND (p.item_id, p.side) NOT IN (
                SELECT item_id, side FROM price_instants
                ORDER BY updated_at DESC, item_id, side
                LIMIT $2
              )",
        )
        .bind(cutoff)
        .bind(keep.max(0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
