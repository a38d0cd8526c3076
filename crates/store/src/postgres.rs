//! PostgreSQL-backed store.
//!
//! Every query runs under the configured timeout, including the pool checkout,
//! so a stalled database surfaces as `StoreError::Timeout` instead of hanging
//! the notification path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_postgres::Row;
use tracing::debug;

use tickhub_schema::{
    Candle, CandleData, CandleSeries, CandleUpdate, FundingData, FundingSeries, FundingSnapshot,
    FundingUpdate, OpenInterestData, OpenInterestSeries, OpenInterestSnapshot,
    OpenInterestUpdate, PairId, Topic, TopicId, TopicMeta,
};

use crate::error::StoreError;
use crate::traits::{HistorySource, RecordLookup, RecordWriter, TopicSource};

const ACTIVE_TOPICS_SQL: &str = "
    SELECT topic_id, pair_id, exchange, base, quote, market_type, sample_interval
    FROM topic_details
    WHERE exchange = $1 AND active
    ORDER BY topic_id";

const PAIR_TOPICS_SQL: &str = "
    SELECT pair_id, topic_id FROM topic_details
    WHERE active
    ORDER BY pair_id, topic_id";

const ACTIVE_AMONG_SQL: &str = "
    SELECT topic_id FROM topic_details
    WHERE topic_id = ANY($1) AND active
    ORDER BY topic_id";

const UPSERT_CANDLE_SQL: &str = "
    INSERT INTO candles (time, topic_id, open, high, low, close, volume, num_trades)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (time, topic_id) DO UPDATE SET
        open = EXCLUDED.open,
        high = EXCLUDED.high,
        low = EXCLUDED.low,
        close = EXCLUDED.close,
        volume = EXCLUDED.volume,
        num_trades = EXCLUDED.num_trades";

const UPSERT_FUNDING_SQL: &str = "
    INSERT INTO funding_rates (time, pair_id, funding_rate, premium, mark_price, index_price,
                               oracle_price, mid_price, next_funding_time)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (time, pair_id) DO UPDATE SET
        funding_rate = EXCLUDED.funding_rate,
        premium = EXCLUDED.premium,
        mark_price = EXCLUDED.mark_price,
        index_price = EXCLUDED.index_price,
        oracle_price = EXCLUDED.oracle_price,
        mid_price = EXCLUDED.mid_price,
        next_funding_time = EXCLUDED.next_funding_time";

const UPSERT_OPEN_INTEREST_SQL: &str = "
    INSERT INTO open_interest (time, pair_id, open_interest, notional_value,
                               day_base_volume, day_notional_volume)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (time, pair_id) DO UPDATE SET
        open_interest = EXCLUDED.open_interest,
        notional_value = EXCLUDED.notional_value,
        day_base_volume = EXCLUDED.day_base_volume,
        day_notional_volume = EXCLUDED.day_notional_volume";

const CANDLE_UPDATE_SQL: &str = "
    SELECT d.topic_id, d.pair_id, d.exchange, d.base, d.quote, d.market_type, d.sample_interval,
           c.time, c.open, c.high, c.low, c.close, c.volume, c.num_trades
    FROM candles c
    JOIN topic_details d ON d.topic_id = c.topic_id
    WHERE c.topic_id = $1 AND date_trunc('second', c.time) = $2";

const FUNDING_UPDATE_SQL: &str = "
    SELECT d.topic_id, d.pair_id, d.exchange, d.base, d.quote, d.market_type, d.sample_interval,
           f.time, f.funding_rate, f.premium, f.mark_price, f.index_price, f.oracle_price,
           f.mid_price, f.next_funding_time
    FROM funding_rates f
    JOIN topic_details d ON d.pair_id = f.pair_id
    WHERE d.topic_id = $1 AND date_trunc('second', f.time) = $2";

const OPEN_INTEREST_UPDATE_SQL: &str = "
    SELECT d.topic_id, d.pair_id, d.exchange, d.base, d.quote, d.market_type, d.sample_interval,
           o.time, o.open_interest, o.notional_value, o.day_base_volume, o.day_notional_volume
    FROM open_interest o
    JOIN topic_details d ON d.pair_id = o.pair_id
    WHERE d.topic_id = $1 AND date_trunc('second', o.time) = $2";

const CANDLE_HISTORY_SQL: &str = "
    WITH ranked AS (
        SELECT c.*, row_number() OVER (PARTITION BY c.topic_id ORDER BY c.time DESC) AS rn
        FROM candles c
        WHERE c.topic_id = ANY($1)
    )
    SELECT d.topic_id, d.pair_id, d.exchange, d.base, d.quote, d.market_type, d.sample_interval,
           r.time, r.open, r.high, r.low, r.close, r.volume, r.num_trades
    FROM ranked r
    JOIN topic_details d ON d.topic_id = r.topic_id
    WHERE r.rn <= $2
    ORDER BY d.topic_id, r.time";

const FUNDING_HISTORY_SQL: &str = "
    WITH ranked AS (
        SELECT f.*, row_number() OVER (PARTITION BY f.pair_id ORDER BY f.time DESC) AS rn
        FROM funding_rates f
        WHERE f.pair_id IN (SELECT pair_id FROM topic_details WHERE topic_id = ANY($1))
    )
    SELECT d.topic_id, d.pair_id, d.exchange, d.base, d.quote, d.market_type, d.sample_interval,
           r.time, r.funding_rate, r.premium, r.mark_price, r.index_price, r.oracle_price,
           r.mid_price, r.next_funding_time
    FROM ranked r
    JOIN topic_details d ON d.pair_id = r.pair_id
    WHERE r.rn <= $2 AND d.topic_id = ANY($1)
    ORDER BY d.topic_id, r.time";

const OPEN_INTEREST_HISTORY_SQL: &str = "
    WITH ranked AS (
        SELECT o.*, row_number() OVER (PARTITION BY o.pair_id ORDER BY o.time DESC) AS rn
        FROM open_interest o
        WHERE o.pair_id IN (SELECT pair_id FROM topic_details WHERE topic_id = ANY($1))
    )
    SELECT d.topic_id, d.pair_id, d.exchange, d.base, d.quote, d.market_type, d.sample_interval,
           r.time, r.open_interest, r.notional_value, r.day_base_volume, r.day_notional_volume
    FROM ranked r
    JOIN topic_details d ON d.pair_id = r.pair_id
    WHERE r.rn <= $2 AND d.topic_id = ANY($1)
    ORDER BY d.topic_id, r.time";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    query_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: Pool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.query_timeout))?
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>, StoreError> {
        self.timed(async {
            let client = self.pool.get().await?;
            let stmt = client.prepare_cached(sql).await?;
            Ok(client.query(&stmt, params).await?)
        })
        .await
    }

    async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Option<Row>, StoreError> {
        self.timed(async {
            let client = self.pool.get().await?;
            let stmt = client.prepare_cached(sql).await?;
            Ok(client.query_opt(&stmt, params).await?)
        })
        .await
    }
}

fn topic_from_row(row: &Row) -> Topic {
    Topic {
        id: TopicId(row.get("topic_id")),
        pair_id: PairId(row.get("pair_id")),
        exchange: row.get("exchange"),
        base: row.get("base"),
        quote: row.get("quote"),
        market_type: row.get("market_type"),
        interval: row.get("sample_interval"),
    }
}

fn meta_from_row(row: &Row) -> TopicMeta {
    TopicMeta::from(&topic_from_row(row))
}

fn candle_data(row: &Row) -> CandleData {
    CandleData {
        time: row.get("time"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
        num_trades: row.get("num_trades"),
    }
}

fn funding_data(row: &Row) -> FundingData {
    FundingData {
        time: row.get("time"),
        funding_rate: row.get("funding_rate"),
        premium: row.get("premium"),
        mark_price: row.get("mark_price"),
        index_price: row.get("index_price"),
        oracle_price: row.get("oracle_price"),
        mid_price: row.get("mid_price"),
        next_funding_time: row.get("next_funding_time"),
    }
}

fn open_interest_data(row: &Row) -> OpenInterestData {
    OpenInterestData {
        time: row.get("time"),
        open_interest: row.get("open_interest"),
        notional_value: row.get("notional_value"),
        day_base_volume: row.get("day_base_volume"),
        day_notional_volume: row.get("day_notional_volume"),
    }
}

/// Group rows ordered by topic into one entry per topic.
fn group_by_topic<D>(rows: &[Row], data: fn(&Row) -> D) -> Vec<(TopicMeta, Vec<D>)> {
    let mut grouped: Vec<(TopicMeta, Vec<D>)> = Vec::new();
    for row in rows {
        let topic_id = TopicId(row.get("topic_id"));
        match grouped.last_mut() {
            Some((meta, items)) if meta.topic_id == topic_id => items.push(data(row)),
            _ => grouped.push((meta_from_row(row), vec![data(row)])),
        }
    }
    grouped
}

fn topic_keys(ids: &[TopicId]) -> Vec<i32> {
    ids.iter().map(|id| id.0).collect()
}

#[async_trait]
impl TopicSource for PgStore {
    async fn active_topics(&self, exchange: &str) -> Result<Vec<Topic>, StoreError> {
        let rows = self.query(ACTIVE_TOPICS_SQL, &[&exchange]).await?;
        Ok(rows.iter().map(topic_from_row).collect())
    }
}

#[async_trait]
impl RecordWriter for PgStore {
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<u64, StoreError> {
        if candles.is_empty() {
            return Ok(0);
        }
        self.timed(async {
            let mut client = self.pool.get().await?;
            let tx = client.transaction().await?;
            let stmt = tx.prepare_cached(UPSERT_CANDLE_SQL).await?;
            let mut written = 0;
            for c in candles {
                written += tx
                    .execute(
                        &stmt,
                        &[
                            &c.time,
                            &c.topic.0,
                            &c.open,
                            &c.high,
                            &c.low,
                            &c.close,
                            &c.volume,
                            &c.num_trades,
                        ],
                    )
                    .await?;
            }
            tx.commit().await?;
            debug!(rows = written, "upserted candles");
            Ok(written)
        })
        .await
    }

    async fn upsert_funding(&self, rows: &[FundingSnapshot]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.timed(async {
            let mut client = self.pool.get().await?;
            let tx = client.transaction().await?;
            let stmt = tx.prepare_cached(UPSERT_FUNDING_SQL).await?;
            let mut written = 0;
            for f in rows {
                written += tx
                    .execute(
                        &stmt,
                        &[
                            &f.time,
                            &f.pair.0,
                            &f.funding_rate,
                            &f.premium,
                            &f.mark_price,
                            &f.index_price,
                            &f.oracle_price,
                            &f.mid_price,
                            &f.next_funding_time,
                        ],
                    )
                    .await?;
            }
            tx.commit().await?;
            debug!(rows = written, "upserted funding rates");
            Ok(written)
        })
        .await
    }

    async fn upsert_open_interest(
        &self,
        rows: &[OpenInterestSnapshot],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.timed(async {
            let mut client = self.pool.get().await?;
            let tx = client.transaction().await?;
            let stmt = tx.prepare_cached(UPSERT_OPEN_INTEREST_SQL).await?;
            let mut written = 0;
            for o in rows {
                written += tx
                    .execute(
                        &stmt,
                        &[
                            &o.time,
                            &o.pair.0,
                            &o.open_interest,
                            &o.notional_value,
                            &o.day_base_volume,
                            &o.day_notional_volume,
                        ],
                    )
                    .await?;
            }
            tx.commit().await?;
            debug!(rows = written, "upserted open interest");
            Ok(written)
        })
        .await
    }
}

#[async_trait]
impl RecordLookup for PgStore {
    async fn pair_topics(&self) -> Result<HashMap<PairId, Vec<TopicId>>, StoreError> {
        let rows = self.query(PAIR_TOPICS_SQL, &[]).await?;
        let mut pairs: HashMap<PairId, Vec<TopicId>> = HashMap::new();
        for row in &rows {
            pairs
                .entry(PairId(row.get(0)))
                .or_default()
                .push(TopicId(row.get(1)));
        }
        Ok(pairs)
    }

    async fn candle_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<CandleUpdate>, StoreError> {
        let row = self.query_opt(CANDLE_UPDATE_SQL, &[&topic.0, &time]).await?;
        Ok(row.map(|r| CandleUpdate {
            meta: meta_from_row(&r),
            data: candle_data(&r),
        }))
    }

    async fn funding_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<FundingUpdate>, StoreError> {
        let row = self.query_opt(FUNDING_UPDATE_SQL, &[&topic.0, &time]).await?;
        Ok(row.map(|r| FundingUpdate {
            meta: meta_from_row(&r),
            data: funding_data(&r),
        }))
    }

    async fn open_interest_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<OpenInterestUpdate>, StoreError> {
        let row = self
            .query_opt(OPEN_INTEREST_UPDATE_SQL, &[&topic.0, &time])
            .await?;
        Ok(row.map(|r| OpenInterestUpdate {
            meta: meta_from_row(&r),
            data: open_interest_data(&r),
        }))
    }
}

#[async_trait]
impl HistorySource for PgStore {
    async fn active_topics_among(&self, ids: &[TopicId]) -> Result<Vec<TopicId>, StoreError> {
        let keys = topic_keys(ids);
        let rows = self.query(ACTIVE_AMONG_SQL, &[&keys]).await?;
        Ok(rows.iter().map(|r| TopicId(r.get(0))).collect())
    }

    async fn candle_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<CandleSeries>, StoreError> {
        let keys = topic_keys(ids);
        let limit = i64::from(limit);
        let rows = self.query(CANDLE_HISTORY_SQL, &[&keys, &limit]).await?;
        Ok(group_by_topic(&rows, candle_data)
            .into_iter()
            .map(|(meta, data)| CandleSeries {
                meta,
                count: data.len(),
                data,
            })
            .collect())
    }

    async fn funding_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<FundingSeries>, StoreError> {
        let keys = topic_keys(ids);
        let limit = i64::from(limit);
        let rows = self.query(FUNDING_HISTORY_SQL, &[&keys, &limit]).await?;
        Ok(group_by_topic(&rows, funding_data)
            .into_iter()
            .map(|(meta, data)| FundingSeries {
                meta,
                count: data.len(),
                data,
            })
            .collect())
    }

    async fn open_interest_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<OpenInterestSeries>, StoreError> {
        let keys = topic_keys(ids);
        let limit = i64::from(limit);
        let rows = self.query(OPEN_INTEREST_HISTORY_SQL, &[&keys, &limit]).await?;
        Ok(group_by_topic(&rows, open_interest_data)
            .into_iter()
            .map(|(meta, data)| OpenInterestSeries {
                meta,
                count: data.len(),
                data,
            })
            .collect())
    }
}
