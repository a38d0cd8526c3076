//! In-memory store used by tests and local runs without PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use tickhub_schema::{
    Candle, CandleData, CandleSeries, CandleUpdate, FundingData, FundingSeries, FundingSnapshot,
    FundingUpdate, OpenInterestData, OpenInterestSeries, OpenInterestSnapshot,
    OpenInterestUpdate, PairId, Topic, TopicId, TopicMeta,
};

use crate::error::StoreError;
use crate::traits::{HistorySource, RecordLookup, RecordWriter, TopicSource};

#[derive(Default)]
struct MemoryState {
    topics: BTreeMap<TopicId, (Topic, bool)>,
    candles: BTreeMap<(TopicId, DateTime<Utc>), Candle>,
    funding: BTreeMap<(PairId, DateTime<Utc>), FundingSnapshot>,
    open_interest: BTreeMap<(PairId, DateTime<Utc>), OpenInterestSnapshot>,
}

impl MemoryState {
    fn active_topic(&self, id: TopicId) -> Option<&Topic> {
        self.topics
            .get(&id)
            .and_then(|(topic, active)| active.then_some(topic))
    }
}

pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
    enrichment_queries: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            unavailable: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            enrichment_queries: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
        }
    }

    pub async fn add_topic(&self, topic: Topic) {
        let mut state = self.state.write().await;
        state.topics.insert(topic.id, (topic, true));
    }

    pub async fn deactivate_topic(&self, id: TopicId) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.topics.get_mut(&id) {
            entry.1 = false;
        }
    }

    /// Every call fails with `StoreError::Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Upserts fail while set; reads keep working
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `RecordLookup` queries served, pair map loads included
    pub fn enrichment_queries(&self) -> usize {
        self.enrichment_queries.load(Ordering::SeqCst)
    }

    /// Number of upsert calls, successful or not
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub async fn candles(&self) -> Vec<Candle> {
        self.state.read().await.candles.values().cloned().collect()
    }

    pub async fn funding(&self) -> Vec<FundingSnapshot> {
        self.state.read().await.funding.values().cloned().collect()
    }

    pub async fn open_interest(&self) -> Vec<OpenInterestSnapshot> {
        self.state.read().await.open_interest.values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn candle_data(c: &Candle) -> CandleData {
    CandleData {
        time: c.time,
        open: c.open,
        high: c.high,
        low: c.low,
        close: c.close,
        volume: c.volume,
        num_trades: c.num_trades,
    }
}

fn funding_data(f: &FundingSnapshot) -> FundingData {
    FundingData {
        time: f.time,
        funding_rate: f.funding_rate,
        premium: f.premium,
        mark_price: f.mark_price,
        index_price: f.index_price,
        oracle_price: f.oracle_price,
        mid_price: f.mid_price,
        next_funding_time: f.next_funding_time,
    }
}

fn open_interest_data(o: &OpenInterestSnapshot) -> OpenInterestData {
    OpenInterestData {
        time: o.time,
        open_interest: o.open_interest,
        notional_value: o.notional_value,
        day_base_volume: o.day_base_volume,
        day_notional_volume: o.day_notional_volume,
    }
}

/// Last `limit` items, oldest first
fn tail<T: Clone>(items: Vec<T>, limit: u32) -> Vec<T> {
    let skip = items.len().saturating_sub(limit as usize);
    items.into_iter().skip(skip).collect()
}

fn unique(ids: &[TopicId]) -> Vec<TopicId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[async_trait]
impl TopicSource for MemoryStore {
    async fn active_topics(&self, exchange: &str) -> Result<Vec<Topic>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .topics
            .values()
            .filter(|(topic, active)| *active && topic.exchange == exchange)
            .map(|(topic, _)| topic.clone())
            .collect())
    }
}

#[async_trait]
impl RecordWriter for MemoryStore {
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        for c in candles {
            state.candles.insert((c.topic, c.time), c.clone());
        }
        Ok(candles.len() as u64)
    }

    async fn upsert_funding(&self, rows: &[FundingSnapshot]) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        for f in rows {
            state.funding.insert((f.pair, f.time), f.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_open_interest(
        &self,
        rows: &[OpenInterestSnapshot],
    ) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        for o in rows {
            state.open_interest.insert((o.pair, o.time), o.clone());
        }
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl RecordLookup for MemoryStore {
    async fn pair_topics(&self) -> Result<HashMap<PairId, Vec<TopicId>>, StoreError> {
        self.enrichment_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let state = self.state.read().await;
        let mut pairs: HashMap<PairId, Vec<TopicId>> = HashMap::new();
        for (topic, _) in state.topics.values().filter(|(_, active)| *active) {
            pairs.entry(topic.pair_id).or_default().push(topic.id);
        }
        Ok(pairs)
    }

    async fn candle_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<CandleUpdate>, StoreError> {
        self.enrichment_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let state = self.state.read().await;
        let Some(meta) = state.topics.get(&topic).map(|(t, _)| TopicMeta::from(t)) else {
            return Ok(None);
        };
        Ok(state.candles.get(&(topic, time)).map(|c| CandleUpdate {
            meta,
            data: candle_data(c),
        }))
    }

    async fn funding_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<FundingUpdate>, StoreError> {
        self.enrichment_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let state = self.state.read().await;
        let Some(t) = state.topics.get(&topic).map(|(t, _)| t) else {
            return Ok(None);
        };
        Ok(state.funding.get(&(t.pair_id, time)).map(|f| FundingUpdate {
            meta: TopicMeta::from(t),
            data: funding_data(f),
        }))
    }

    async fn open_interest_update(
        &self,
        topic: TopicId,
        time: DateTime<Utc>,
    ) -> Result<Option<OpenInterestUpdate>, StoreError> {
        self.enrichment_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let state = self.state.read().await;
        let Some(t) = state.topics.get(&topic).map(|(t, _)| t) else {
            return Ok(None);
        };
        Ok(state
            .open_interest
            .get(&(t.pair_id, time))
            .map(|o| OpenInterestUpdate {
                meta: TopicMeta::from(t),
                data: open_interest_data(o),
            }))
    }
}

#[async_trait]
impl HistorySource for MemoryStore {
    async fn active_topics_among(&self, ids: &[TopicId]) -> Result<Vec<TopicId>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(unique(ids)
            .into_iter()
            .filter(|id| state.active_topic(*id).is_some())
            .collect())
    }

    async fn candle_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<CandleSeries>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut out = Vec::new();
        for id in unique(ids) {
            let Some(topic) = state.topics.get(&id).map(|(t, _)| t) else {
                continue;
            };
            let rows: Vec<CandleData> = state
                .candles
                .range((id, DateTime::<Utc>::MIN_UTC)..=(id, DateTime::<Utc>::MAX_UTC))
                .map(|(_, c)| candle_data(c))
                .collect();
            let data = tail(rows, limit);
            if !data.is_empty() {
                out.push(CandleSeries {
                    meta: TopicMeta::from(topic),
                    count: data.len(),
                    data,
                });
            }
        }
        Ok(out)
    }

    async fn funding_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<FundingSeries>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut out = Vec::new();
        for id in unique(ids) {
            let Some(topic) = state.topics.get(&id).map(|(t, _)| t) else {
                continue;
            };
            let pair = topic.pair_id;
            let rows: Vec<FundingData> = state
                .funding
                .range((pair, DateTime::<Utc>::MIN_UTC)..=(pair, DateTime::<Utc>::MAX_UTC))
                .map(|(_, f)| funding_data(f))
                .collect();
            let data = tail(rows, limit);
            if !data.is_empty() {
                out.push(FundingSeries {
                    meta: TopicMeta::from(topic),
                    count: data.len(),
                    data,
                });
            }
        }
        Ok(out)
    }

    async fn open_interest_history(
        &self,
        ids: &[TopicId],
        limit: u32,
    ) -> Result<Vec<OpenInterestSeries>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut out = Vec::new();
        for id in unique(ids) {
            let Some(topic) = state.topics.get(&id).map(|(t, _)| t) else {
                continue;
            };
            let pair = topic.pair_id;
            let rows: Vec<OpenInterestData> = state
                .open_interest
                .range((pair, DateTime::<Utc>::MIN_UTC)..=(pair, DateTime::<Utc>::MAX_UTC))
                .map(|(_, o)| open_interest_data(o))
                .collect();
            let data = tail(rows, limit);
            if !data.is_empty() {
                out.push(OpenInterestSeries {
                    meta: TopicMeta::from(topic),
                    count: data.len(),
                    data,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn topic(id: i32, pair: i32, interval: &str) -> Topic {
        Topic {
            id: TopicId(id),
            pair_id: PairId(pair),
            exchange: "hyperliquid".to_string(),
            base: "BTC".to_string(),
            quote: "USD".to_string(),
            market_type: "perps".to_string(),
            interval: interval.to_string(),
        }
    }

    fn candle(topic: i32, minute: u32, close: rust_decimal::Decimal) -> Candle {
        Candle {
            time: Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap(),
            topic: TopicId(topic),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close,
            volume: dec!(1),
            num_trades: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_key() {
        let store = MemoryStore::new();
        store.add_topic(topic(7, 3, "1m")).await;

        store.upsert_candles(&[candle(7, 0, dec!(101))]).await.unwrap();
        store.upsert_candles(&[candle(7, 0, dec!(102))]).await.unwrap();

        let candles = store.candles().await;
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, dec!(102));
    }

    #[tokio::test]
    async fn test_active_topics_filters_exchange_and_inactive() {
        let store = MemoryStore::new();
        store.add_topic(topic(1, 1, "1m")).await;
        store.add_topic(topic(2, 1, "5m")).await;
        let mut other = topic(3, 2, "1m");
        other.exchange = "binance".to_string();
        store.add_topic(other).await;
        store.deactivate_topic(TopicId(2)).await;

        let topics = store.active_topics("hyperliquid").await.unwrap();
        assert_eq!(topics.iter().map(|t| t.id).collect::<Vec<_>>(), vec![TopicId(1)]);
    }

    #[tokio::test]
    async fn test_candle_history_returns_latest_oldest_first() {
        let store = MemoryStore::new();
        store.add_topic(topic(7, 3, "1m")).await;
        let rows: Vec<Candle> = (0..5).map(|m| candle(7, m, dec!(100))).collect();
        store.upsert_candles(&rows).await.unwrap();

        let history = store.candle_history(&[TopicId(7), TopicId(8)], 3).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].count, 3);
        let minutes: Vec<_> = history[0].data.iter().map(|d| d.time).collect();
        assert_eq!(minutes[0], Utc.with_ymd_and_hms(2024, 3, 1, 12, 2, 0).unwrap());
        assert_eq!(minutes[2], Utc.with_ymd_and_hms(2024, 3, 1, 12, 4, 0).unwrap());
    }

    #[tokio::test]
    async fn test_pair_topics_groups_active_topics() {
        let store = MemoryStore::new();
        store.add_topic(topic(1, 3, "1m")).await;
        store.add_topic(topic(2, 3, "15m")).await;
        store.add_topic(topic(3, 4, "1m")).await;
        store.add_topic(topic(4, 4, "5m")).await;
        store.deactivate_topic(TopicId(4)).await;

        let pairs = store.pair_topics().await.unwrap();
        assert_eq!(pairs[&PairId(3)], vec![TopicId(1), TopicId(2)]);
        assert_eq!(pairs[&PairId(4)], vec![TopicId(3)]);
        assert_eq!(store.enrichment_queries(), 1);
    }

    #[tokio::test]
    async fn test_failing_writes_counted() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.upsert_candles(&[candle(7, 0, dec!(100))]).await.is_err());
        assert_eq!(store.write_calls(), 1);
        assert!(store.candles().await.is_empty());
    }
}
