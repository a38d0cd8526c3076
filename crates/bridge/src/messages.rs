//! Notification channels and payloads.
//!
//! Triggers send `{"topic_key": <int>, "time": "<timestamp>"}` on one channel
//! per record kind. The key is a topic id for candles and a pair id for
//! funding and open interest.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Candle,
    Funding,
    OpenInterest,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Candle, Channel::Funding, Channel::OpenInterest];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Candle => "candle_updates",
            Channel::Funding => "funding_updates",
            Channel::OpenInterest => "oi_updates",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

#[derive(Debug, Deserialize)]
struct NotifyPayload {
    #[serde(alias = "starlisting_id", alias = "trading_pair_id")]
    topic_key: i32,
    time: String,
}

/// One decoded row-change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub channel: Channel,
    pub key: i32,
    pub time: DateTime<Utc>,
}

pub fn parse_notification(channel: &str, payload: &str) -> Result<ChangeEvent, BridgeError> {
    let channel = Channel::from_name(channel)
        .ok_or_else(|| BridgeError::InvalidPayload(format!("unknown channel {}", channel)))?;
    let payload: NotifyPayload = serde_json::from_str(payload)?;
    Ok(ChangeEvent {
        channel,
        key: payload.topic_key,
        time: parse_timestamp(&payload.time)?,
    })
}

/// RFC 3339, or PostgreSQL's own `timestamptz` text form
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, BridgeError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(t) = DateTime::parse_from_str(s, format) {
            return Ok(t.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(t.and_utc());
        }
    }
    Err(BridgeError::InvalidPayload(format!("bad timestamp {:?}", s)))
}
