use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use tickhub_schema::{
    Candle, CandleSeries, CandleUpdate, FundingSeries, FundingSnapshot, FundingUpdate,
    OpenInterestSeries, OpenInterestSnapshot, OpenInterestUpdate, PairId, Topic, TopicId,
};

use crate::error::StoreError;

/// Source of the topics a collector is responsible for
#[async_trait]
pub trait TopicSource: Send + Sync {
    /// Active topics of one exchange, ordered by id
    async fn active_topics(&self, exchange: &str) -> Result<Vec<Topic>, StoreError>;
}

/// Idempotent upserts keyed by (time, topic)
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Returns the number of rows written
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<u64, StoreError>;

    async fn upsert_funding(&self, rows: &[FundingSnapshot]) -> Result<u64, StoreError>;

    async fn upsert_open_interest(&self, rows: &[OpenInterestSnapshot])
        -> Result<u64, StoreError>;
}

/// Enrichment queries used when a change notification arrives
#[async_trait]
pub trait RecordLookup: Send + Sync {
    /// Active fine-grained topics grouped by their pair
    async fn pair_topics(&self) -> Result<HashMap<PairId, Vec<TopicId>>, StoreError>;

    async fn candle_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<CandleUpdate>, StoreError>;

    /// Funding row of the topic's pair, described with the topic's metadata
    async fn funding_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<FundingUpdate>, StoreError>;

    async fn open_interest_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<OpenInterestUpdate>, StoreError>;
}

/// Recent history served to a client when it subscribes.
///
/// Each query returns at most `limit` rows per topic, oldest first, and omits
/// topics without data.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// The subset of `ids` that exist and are active
    async fn active_topics_among(&self, ids: &[TopicId]) -> Result<Vec<TopicId>, StoreError>;

    async fn candle_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<CandleSeries>, StoreError>;

    async fn funding_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<FundingSeries>, StoreError>;

    async fn open_interest_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<OpenInterestSeries>, StoreError>;
}
