//! Hyperliquid candle adapter.
//!
//! One `candle` subscription per topic. Every valid candle is upserted as it
//! arrives; a failed write is logged and the candle is not retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use tickhub_schema::{Candle, RecordKind, Topic, TopicId};
use tickhub_store::RecordWriter;

use super::messages::{HyperliquidMessage, WsCandle};
use super::websocket::{HyperliquidWebSocket, PING_INTERVAL_SECS};
use crate::error::CollectorError;
use crate::metrics::{CollectorMetrics, DropReason};
use crate::traits::{CollectContext, StreamAdapter};

/// Result of handling one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    Dropped(DropReason),
    Ignored,
}

fn route_key(coin: &str, interval: &str) -> String {
    format!("{}_{}", coin, interval)
}

/// Routes candle frames to topics and writes them
struct CandleHandler {
    routes: HashMap<String, TopicId>,
    writer: Arc<dyn RecordWriter>,
    metrics: CollectorMetrics,
}

impl CandleHandler {
    fn to_candle(&self, raw: &WsCandle) -> Option<Candle> {
        let topic = *self.routes.get(&route_key(&raw.coin, &raw.interval))?;
        let time = DateTime::<Utc>::from_timestamp_millis(raw.open_time_ms)?;
        Some(Candle {
            time,
            topic,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            num_trades: raw.num_trades.and_then(|n| i32::try_from(n).ok()),
        })
    }

    async fn handle_text(&self, text: &str, ctx: &CollectContext) -> Outcome {
        let kind = RecordKind::Candle.as_str();
        let msg = match HyperliquidMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Malformed Hyperliquid message, dropped");
                self.metrics.add_dropped(kind, DropReason::Malformed, 1);
                return Outcome::Dropped(DropReason::Malformed);
            }
        };
        self.metrics.inc_message(msg.channel());

        let raw = match msg {
            HyperliquidMessage::Candle(raw) => raw,
            HyperliquidMessage::Error(message) => {
                warn!(message = %message, "Hyperliquid WS error");
                return Outcome::Ignored;
            }
            other => {
                trace!(channel = other.channel(), "Ignoring message");
                return Outcome::Ignored;
            }
        };

        let Some(candle) = self.to_candle(&raw) else {
            warn!(coin = %raw.coin, interval = %raw.interval, "Candle for unknown topic, skipped");
            self.metrics.add_dropped(kind, DropReason::UnknownTopic, 1);
            return Outcome::Dropped(DropReason::UnknownTopic);
        };

        if let Err(e) = candle.validate() {
            warn!(topic = %candle.topic, time = %candle.time, error = %e, "Invalid candle dropped");
            self.metrics.add_dropped(kind, DropReason::Invalid, 1);
            return Outcome::Dropped(DropReason::Invalid);
        }

        match self.writer.upsert_candles(std::slice::from_ref(&candle)).await {
            Ok(n) => {
                self.metrics.add_written(kind, n);
                ctx.record_write();
                Outcome::Written
            }
            Err(e) => {
                error!(topic = %candle.topic, time = %candle.time, error = %e, "Candle write failed, dropped");
                self.metrics.add_dropped(kind, DropReason::WriteFailed, 1);
                Outcome::Dropped(DropReason::WriteFailed)
            }
        }
    }
}

pub struct HyperliquidCandles {
    exchange: String,
    url: String,
    topics: Vec<Topic>,
    handler: CandleHandler,
    ws: Option<HyperliquidWebSocket>,
}

impl HyperliquidCandles {
    pub fn new(
        name: impl Into<String>,
        exchange: impl Into<String>,
        url: impl Into<String>,
        writer: Arc<dyn RecordWriter>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            url: url.into(),
            topics: Vec::new(),
            handler: CandleHandler {
                routes: HashMap::new(),
                writer,
                metrics: CollectorMetrics::new(name),
            },
            ws: None,
        }
    }
}

#[async_trait]
impl StreamAdapter for HyperliquidCandles {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    fn initialize(&mut self, topics: Vec<Topic>) {
        self.handler.routes = topics
            .iter()
            .map(|t| (route_key(&t.base, &t.interval), t.id))
            .collect();
        self.topics = topics;
    }

    async fn connect(&mut self) -> Result<(), CollectorError> {
        if self.topics.is_empty() {
            debug!("No candle topics, not opening a stream");
            return Ok(());
        }

        let mut ws = HyperliquidWebSocket::connect(&self.url)
            .await
            .map_err(|e| CollectorError::ConnectionFailed(e.to_string()))?;

        for topic in &self.topics {
            ws.subscribe(json!({
                "type": "candle",
                "coin": topic.base,
                "interval": topic.interval,
            }))
            .await
            .map_err(|e| {
                CollectorError::ConnectionFailed(format!("subscribe {}: {}", topic.trading_pair(), e))
            })?;
        }

        info!(topics = self.topics.len(), "Subscribed to Hyperliquid candles");
        self.ws = Some(ws);
        Ok(())
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<(), CollectorError> {
        let Some(ws) = self.ws.as_mut() else {
            // idle: nothing subscribed
            ctx.stopped().await;
            return Ok(());
        };

        let period = Duration::from_secs(PING_INTERVAL_SECS);
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.stopped() => return Ok(()),
                _ = ping.tick() => {
                    trace!("Sending Hyperliquid ping");
                    ws.ping().await?;
                }
                text = ws.recv() => {
                    self.handler.handle_text(&text?, ctx).await;
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            if let Err(e) = ws.close().await {
                debug!(error = %e, "Close handshake failed");
            }
        }
    }
}
