//! Hyperliquid WebSocket message types.
//!
//! Messages are `{"channel": ..., "data": ...}`. Prices arrive as decimal
//! strings and are parsed straight into `Decimal`. Channels this crate does
//! not consume decode to `Other` whatever their payload.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum HyperliquidMessage {
    Candle(WsCandle),
    ActiveAssetCtx(WsActiveAssetCtx),
    SubscriptionResponse(Value),
    Error(String),
    Pong,
    /// Any other channel, by name
    Other(String),
}

#[derive(Deserialize)]
struct Envelope {
    channel: String,
    #[serde(default)]
    data: Value,
}

impl HyperliquidMessage {
    /// Decode one text frame. Only payloads of known channels are checked.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let Envelope { channel, data } = serde_json::from_str(text)?;
        Ok(match channel.as_str() {
            "candle" => HyperliquidMessage::Candle(serde_json::from_value(data)?),
            "activeAssetCtx" => HyperliquidMessage::ActiveAssetCtx(serde_json::from_value(data)?),
            "subscriptionResponse" => HyperliquidMessage::SubscriptionResponse(data),
            "error" => HyperliquidMessage::Error(match data {
                Value::String(message) => message,
                other => other.to_string(),
            }),
            "pong" => HyperliquidMessage::Pong,
            _ => HyperliquidMessage::Other(channel),
        })
    }

    pub fn channel(&self) -> &'static str {
        match self {
            HyperliquidMessage::Candle(_) => "candle",
            HyperliquidMessage::ActiveAssetCtx(_) => "activeAssetCtx",
            HyperliquidMessage::SubscriptionResponse(_) => "subscriptionResponse",
            HyperliquidMessage::Error(_) => "error",
            HyperliquidMessage::Pong => "pong",
            HyperliquidMessage::Other(_) => "other",
        }
    }
}

/// One candle snapshot; `t` is the open time in epoch milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct WsCandle {
    #[serde(rename = "t")]
    pub open_time_ms: i64,
    #[serde(rename = "T", default)]
    pub close_time_ms: Option<i64>,
    #[serde(rename = "s")]
    pub coin: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    #[serde(rename = "n", default)]
    pub num_trades: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsActiveAssetCtx {
    pub coin: String,
    pub ctx: PerpAssetCtx,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpAssetCtx {
    pub funding: Decimal,
    #[serde(default)]
    pub premium: Option<Decimal>,
    #[serde(default)]
    pub mark_px: Option<Decimal>,
    #[serde(default)]
    pub oracle_px: Option<Decimal>,
    #[serde(default)]
    pub mid_px: Option<Decimal>,
    pub open_interest: Decimal,
    #[serde(default)]
    pub day_base_vlm: Option<Decimal>,
    #[serde(default)]
    pub day_ntl_vlm: Option<Decimal>,
}
