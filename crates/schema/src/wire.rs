//! Outbound JSON messages for streaming clients.
//!
//! Live updates and historical replies share the same topic metadata so a
//! client can render either without a second lookup.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::topic::{Topic, TopicId};

/// Descriptive metadata attached to every record sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMeta {
    pub topic_id: TopicId,
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub trading_pair: String,
    pub market_type: String,
    pub interval: String,
}

impl From<&Topic> for TopicMeta {
    fn from(topic: &Topic) -> Self {
        Self {
            topic_id: topic.id,
            exchange: topic.exchange.clone(),
            base: topic.base.clone(),
            quote: topic.quote.clone(),
            trading_pair: topic.trading_pair(),
            market_type: topic.market_type.clone(),
            interval: topic.interval.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleData {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub num_trades: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingData {
    pub time: DateTime<Utc>,
    pub funding_rate: Decimal,
    pub premium: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub oracle_price: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestData {
    pub time: DateTime<Utc>,
    pub open_interest: Decimal,
    pub notional_value: Option<Decimal>,
    pub day_base_volume: Option<Decimal>,
    pub day_notional_volume: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    #[serde(flatten)]
    pub meta: TopicMeta,
    pub data: CandleData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingUpdate {
    #[serde(flatten)]
    pub meta: TopicMeta,
    pub data: FundingData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestUpdate {
    #[serde(flatten)]
    pub meta: TopicMeta,
    pub data: OpenInterestData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSeries {
    #[serde(flatten)]
    pub meta: TopicMeta,
    pub count: usize,
    pub data: Vec<CandleData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingSeries {
    #[serde(flatten)]
    pub meta: TopicMeta,
    pub count: usize,
    pub data: Vec<FundingData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestSeries {
    #[serde(flatten)]
    pub meta: TopicMeta,
    pub count: usize,
    pub data: Vec<OpenInterestData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJson,
    UnknownAction,
    ValidationError,
    InvalidTopic,
    InternalError,
    HistoricalDataError,
}

/// Every message the server writes to a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Success {
        message: String,
        topic_ids: Vec<TopicId>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Historical(CandleSeries),
    HistoricalFunding(FundingSeries),
    HistoricalOi(OpenInterestSeries),
    Candle(CandleUpdate),
    Funding(FundingUpdate),
    OpenInterest(OpenInterestUpdate),
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code,
        }
    }

    pub fn ping() -> Self {
        ServerMessage::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: Utc::now(),
        }
    }

    /// Value of the `type` tag
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Success { .. } => "success",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Historical(_) => "historical",
            ServerMessage::HistoricalFunding(_) => "historical_funding",
            ServerMessage::HistoricalOi(_) => "historical_oi",
            ServerMessage::Candle(_) => "candle",
            ServerMessage::Funding(_) => "funding",
            ServerMessage::OpenInterest(_) => "open_interest",
        }
    }
}
