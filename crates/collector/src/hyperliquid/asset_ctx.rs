//! Hyperliquid asset-context adapter: funding and open interest.
//!
//! `activeAssetCtx` pushes several updates per second per coin while rows are
//! stored at minute grain. Updates land in latest-value buffers and a flush
//! task writes one row per pair at every minute boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tickhub_schema::{
    truncate_to_minute, CanonicalRecord, FundingSnapshot, OpenInterestSnapshot, PairId,
    RecordKind, Topic,
};
use tickhub_store::{RecordWriter, StoreError};

use super::messages::{HyperliquidMessage, WsActiveAssetCtx};
use super::websocket::{HyperliquidWebSocket, PING_INTERVAL_SECS};
use crate::buffer::{until_next_minute, LatestValueBuffer, FLUSH_INTERVAL};
use crate::error::CollectorError;
use crate::metrics::{CollectorMetrics, DropReason};
use crate::traits::{CollectContext, StreamAdapter};

/// Rows written by one flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flushed {
    pub funding: u64,
    pub open_interest: u64,
}

#[derive(Default)]
pub struct MinuteBuffers {
    pub funding: LatestValueBuffer<PairId, FundingSnapshot>,
    pub open_interest: LatestValueBuffer<PairId, OpenInterestSnapshot>,
}

impl MinuteBuffers {
    /// Replace the pending value for `pair`. Candles are written as they
    /// arrive and never buffered.
    pub fn put(&self, pair: PairId, record: CanonicalRecord) {
        match record {
            CanonicalRecord::Funding(snapshot) => self.funding.put(pair, snapshot),
            CanonicalRecord::OpenInterest(snapshot) => self.open_interest.put(pair, snapshot),
            CanonicalRecord::Candle(candle) => {
                debug!(topic = %candle.topic, "Candle passed to minute buffers, ignored")
            }
        }
    }

    /// Write every buffered row stamped with the minute of `now`.
    ///
    /// A kind whose write fails is put back, keeping any value that arrived
    /// in the meantime.
    pub async fn flush(
        &self,
        writer: &dyn RecordWriter,
        now: DateTime<Utc>,
        metrics: &CollectorMetrics,
    ) -> Result<Flushed, StoreError> {
        let minute = truncate_to_minute(now);
        let mut flushed = Flushed::default();
        let mut first_error = None;

        let drained = self.funding.take();
        if !drained.is_empty() {
            let rows: Vec<FundingSnapshot> = drained
                .values()
                .map(|s| FundingSnapshot { time: minute, ..s.clone() })
                .collect();
            match writer.upsert_funding(&rows).await {
                Ok(n) => {
                    metrics.add_written(RecordKind::Funding.as_str(), n);
                    flushed.funding = n;
                }
                Err(e) => {
                    warn!(rows = rows.len(), error = %e, "Funding flush failed, keeping rows for next minute");
                    self.funding.restore(drained);
                    first_error = Some(e);
                }
            }
        }

        let drained = self.open_interest.take();
        if !drained.is_empty() {
            let rows: Vec<OpenInterestSnapshot> = drained
                .values()
                .map(|s| OpenInterestSnapshot { time: minute, ..s.clone() })
                .collect();
            match writer.upsert_open_interest(&rows).await {
                Ok(n) => {
                    metrics.add_written(RecordKind::OpenInterest.as_str(), n);
                    flushed.open_interest = n;
                }
                Err(e) => {
                    warn!(rows = rows.len(), error = %e, "Open interest flush failed, keeping rows for next minute");
                    self.open_interest.restore(drained);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    pub fn clear(&self) {
        self.funding.clear();
        self.open_interest.clear();
    }
}

async fn flush_loop(
    buffers: Arc<MinuteBuffers>,
    writer: Arc<dyn RecordWriter>,
    metrics: CollectorMetrics,
    ctx: CollectContext,
    stop: CancellationToken,
) {
    let first = Instant::now() + until_next_minute(Utc::now());
    let mut ticker = interval_at(first, FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match buffers.flush(writer.as_ref(), Utc::now(), &metrics).await {
            Ok(flushed) => {
                if flushed.funding + flushed.open_interest > 0 {
                    ctx.record_write();
                }
                debug!(funding = flushed.funding, open_interest = flushed.open_interest, "Minute flush");
            }
            // the next tick is a full interval away
            Err(e) => error!(error = %e, "Minute flush failed"),
        }
    }
}

/// Converts asset-context frames into buffered snapshots
struct AssetCtxHandler {
    coins: HashMap<String, PairId>,
    buffers: Arc<MinuteBuffers>,
    metrics: CollectorMetrics,
}

impl AssetCtxHandler {
    /// The open interest snapshot is `None` when its notional value does not
    /// fit a decimal.
    fn snapshots(
        pair: PairId,
        raw: &WsActiveAssetCtx,
    ) -> (FundingSnapshot, Option<OpenInterestSnapshot>) {
        let now = Utc::now();
        let ctx = &raw.ctx;
        let funding = FundingSnapshot {
            time: now,
            pair,
            funding_rate: ctx.funding,
            premium: ctx.premium,
            mark_price: ctx.mark_px,
            index_price: ctx.oracle_px,
            oracle_price: ctx.oracle_px,
            mid_price: ctx.mid_px,
            next_funding_time: None,
        };
        let notional_value = match ctx.mark_px {
            Some(mark) => match ctx.open_interest.checked_mul(mark) {
                Some(notional) => Some(notional),
                None => return (funding, None),
            },
            None => None,
        };
        let open_interest = OpenInterestSnapshot {
            time: now,
            pair,
            open_interest: ctx.open_interest,
            notional_value,
            day_base_volume: ctx.day_base_vlm,
            day_notional_volume: ctx.day_ntl_vlm,
        };
        (funding, Some(open_interest))
    }

    fn handle_text(&self, text: &str) {
        let msg = match HyperliquidMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Malformed Hyperliquid message, dropped");
                self.metrics
                    .add_dropped(RecordKind::Funding.as_str(), DropReason::Malformed, 1);
                return;
            }
        };
        self.metrics.inc_message(msg.channel());

        let raw = match msg {
            HyperliquidMessage::ActiveAssetCtx(raw) => raw,
            HyperliquidMessage::Error(message) => {
                warn!(message = %message, "Hyperliquid WS error");
                return;
            }
            other => {
                trace!(channel = other.channel(), "Ignoring message");
                return;
            }
        };

        let Some(&pair) = self.coins.get(&raw.coin) else {
            warn!(coin = %raw.coin, "Asset context for unknown coin, skipped");
            self.metrics
                .add_dropped(RecordKind::Funding.as_str(), DropReason::UnknownTopic, 1);
            return;
        };

        let (funding, open_interest) = Self::snapshots(pair, &raw);
        let mut records = vec![CanonicalRecord::Funding(funding)];
        match open_interest {
            Some(snapshot) => records.push(CanonicalRecord::OpenInterest(snapshot)),
            None => {
                warn!(pair = %pair, "Open interest notional overflows, snapshot dropped");
                self.metrics
                    .add_dropped(RecordKind::OpenInterest.as_str(), DropReason::Invalid, 1);
            }
        }

        for record in records {
            let kind = record.kind().as_str();
            match record.validate() {
                Ok(()) => self.buffers.put(pair, record),
                Err(e) => {
                    warn!(pair = %pair, kind, error = %e, "Invalid snapshot dropped");
                    self.metrics.add_dropped(kind, DropReason::Invalid, 1);
                }
            }
        }
    }
}

pub struct HyperliquidAssetContexts {
    exchange: String,
    url: String,
    writer: Arc<dyn RecordWriter>,
    handler: AssetCtxHandler,
    ws: Option<HyperliquidWebSocket>,
}

impl HyperliquidAssetContexts {
    pub fn new(
        name: impl Into<String>,
        exchange: impl Into<String>,
        url: impl Into<String>,
        writer: Arc<dyn RecordWriter>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            url: url.into(),
            writer,
            handler: AssetCtxHandler {
                coins: HashMap::new(),
                buffers: Arc::new(MinuteBuffers::default()),
                metrics: CollectorMetrics::new(name),
            },
            ws: None,
        }
    }

    pub fn buffers(&self) -> Arc<MinuteBuffers> {
        Arc::clone(&self.handler.buffers)
    }

    fn spawn_flush(&self, ctx: &CollectContext, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(flush_loop(
            Arc::clone(&self.handler.buffers),
            Arc::clone(&self.writer),
            self.handler.metrics.clone(),
            ctx.clone(),
            stop,
        ))
    }
}

#[async_trait]
impl StreamAdapter for HyperliquidAssetContexts {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Topics of the same pair share one coin; the first one seen wins.
    fn initialize(&mut self, topics: Vec<Topic>) {
        let mut coins = HashMap::new();
        for topic in topics {
            coins.entry(topic.base).or_insert(topic.pair_id);
        }
        self.handler.coins = coins;
    }

    async fn connect(&mut self) -> Result<(), CollectorError> {
        if self.handler.coins.is_empty() {
            debug!("No coins, not opening a stream");
            return Ok(());
        }

        let mut ws = HyperliquidWebSocket::connect(&self.url)
            .await
            .map_err(|e| CollectorError::ConnectionFailed(e.to_string()))?;

        for coin in self.handler.coins.keys() {
            ws.subscribe(json!({ "type": "activeAssetCtx", "coin": coin }))
                .await
                .map_err(|e| CollectorError::ConnectionFailed(format!("subscribe {}: {}", coin, e)))?;
        }

        info!(coins = self.handler.coins.len(), "Subscribed to Hyperliquid asset contexts");
        self.ws = Some(ws);
        Ok(())
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<(), CollectorError> {
        if self.ws.is_none() {
            ctx.stopped().await;
            return Ok(());
        }

        let flush_stop = ctx.stop_token().child_token();
        let flush = self.spawn_flush(ctx, flush_stop.clone());

        let result: Result<(), CollectorError> = match self.ws.as_mut() {
            Some(ws) => {
                let period = Duration::from_secs(PING_INTERVAL_SECS);
                let mut ping = interval_at(Instant::now() + period, period);
                ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ctx.stopped() => break Ok(()),
                        _ = ping.tick() => {
                            if let Err(e) = ws.ping().await {
                                break Err(e.into());
                            }
                        }
                        text = ws.recv() => match text {
                            Ok(text) => self.handler.handle_text(&text),
                            Err(e) => break Err(e.into()),
                        }
                    }
                }
            }
            None => Ok(()),
        };

        flush_stop.cancel();
        if let Err(e) = flush.await {
            error!(error = %e, "Flush task panicked");
        }
        result
    }

    async fn disconnect(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            if let Err(e) = ws.close().await {
                debug!(error = %e, "Close handshake failed");
            }
        }
        self.handler.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::topic;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tickhub_store::MemoryStore;

    fn frame(coin: &str, funding: &str, oi: &str, mark: &str) -> String {
        json!({
            "channel": "activeAssetCtx",
            "data": {
                "coin": coin,
                "ctx": {
                    "funding": funding, "premium": "0.0001", "markPx": mark,
                    "oraclePx": mark, "midPx": mark, "openInterest": oi,
                    "dayBaseVlm": "100.0", "dayNtlVlm": "5000000.0"
                }
            }
        })
        .to_string()
    }

    fn adapter(name: &str, store: Arc<MemoryStore>) -> HyperliquidAssetContexts {
        let mut adapter = HyperliquidAssetContexts::new(name, "hyperliquid", "wss://localhost", store);
        adapter.initialize(vec![
            topic(7, 3, "hyperliquid", "BTC", "1m"),
            topic(8, 3, "hyperliquid", "BTC", "5m"),
            topic(9, 4, "hyperliquid", "ETH", "1m"),
        ]);
        adapter
    }

    #[tokio::test]
    async fn test_one_row_per_minute_with_latest_value() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter("asset-ctx-latest", store.clone());

        adapter.handler.handle_text(&frame("BTC", "0.0001", "10", "50000"));
        adapter.handler.handle_text(&frame("BTC", "0.0002", "11", "50000"));

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 40).unwrap();
        let flushed = adapter
            .buffers()
            .flush(store.as_ref(), now, &adapter.handler.metrics)
            .await
            .unwrap();
        assert_eq!(flushed, Flushed { funding: 1, open_interest: 1 });

        let funding = store.funding().await;
        assert_eq!(funding.len(), 1);
        assert_eq!(funding[0].pair, PairId(3));
        assert_eq!(funding[0].funding_rate, dec!(0.0002));
        assert_eq!(funding[0].time, Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap());

        let oi = store.open_interest().await;
        assert_eq!(oi[0].open_interest, dec!(11));
        assert_eq!(oi[0].notional_value, Some(dec!(550000)));
    }

    #[tokio::test]
    async fn test_failed_flush_retries_next_minute() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter("asset-ctx-retry", store.clone());
        let buffers = adapter.buffers();
        let metrics = adapter.handler.metrics.clone();

        adapter.handler.handle_text(&frame("ETH", "0.0003", "5", "3000"));
        store.set_fail_writes(true);
        let first = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert!(buffers.flush(store.as_ref(), first, &metrics).await.is_err());
        assert_eq!(buffers.funding.len(), 1);

        store.set_fail_writes(false);
        let second = Utc.with_ymd_and_hms(2024, 3, 1, 12, 31, 0).unwrap();
        buffers.flush(store.as_ref(), second, &metrics).await.unwrap();

        let funding = store.funding().await;
        assert_eq!(funding.len(), 1);
        assert_eq!(funding[0].time, second);
        assert!(buffers.funding.is_empty());
    }

    #[tokio::test]
    async fn test_flush_of_empty_buffers_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter("asset-ctx-empty", store.clone());

        let flushed = adapter
            .buffers()
            .flush(store.as_ref(), Utc::now(), &adapter.handler.metrics)
            .await
            .unwrap();
        assert_eq!(flushed, Flushed::default());
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_coin_and_invalid_values_are_not_buffered() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter("asset-ctx-invalid", store);

        adapter.handler.handle_text(&frame("DOGE", "0.0001", "10", "0.1"));
        adapter.handler.handle_text(&frame("BTC", "0.0001", "-1", "-5"));

        let buffers = adapter.buffers();
        assert!(buffers.funding.is_empty());
        assert!(buffers.open_interest.is_empty());
        assert_eq!(
            adapter.handler.metrics.dropped("funding", DropReason::UnknownTopic),
            1
        );
        assert_eq!(
            adapter.handler.metrics.dropped("open_interest", DropReason::Invalid),
            1
        );
    }

    #[tokio::test]
    async fn test_overflowing_notional_drops_open_interest_only() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter("asset-ctx-overflow", store);

        adapter
            .handler
            .handle_text(&frame("BTC", "0.0001", "79228162514264337593543950", "50000"));

        let buffers = adapter.buffers();
        assert_eq!(buffers.funding.len(), 1);
        assert!(buffers.open_interest.is_empty());
        assert_eq!(
            adapter.handler.metrics.dropped("open_interest", DropReason::Invalid),
            1
        );
    }

    #[tokio::test]
    async fn test_disconnect_clears_buffers() {
        let store = Arc::new(MemoryStore::new());
        let mut adapter = adapter("asset-ctx-clear", store);

        adapter.handler.handle_text(&frame("BTC", "0.0001", "10", "50000"));
        assert_eq!(adapter.buffers().funding.len(), 1);

        adapter.disconnect().await;
        assert!(adapter.buffers().funding.is_empty());
        assert!(adapter.buffers().open_interest.is_empty());
    }

    #[test]
    fn test_one_subscription_per_coin() {
        let adapter = adapter("asset-ctx-coins", Arc::new(MemoryStore::new()));
        assert_eq!(adapter.handler.coins.len(), 2);
        assert_eq!(adapter.handler.coins["BTC"], PairId(3));
    }
}
