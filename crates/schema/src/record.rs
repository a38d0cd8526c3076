//! Canonical market data records
//!
//! Every record carries a minute-truncated timestamp and the topic it belongs
//! to. Records that break their invariants are rejected by `validate` and
//! never reach storage.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topic::{PairId, TopicId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: Decimal },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: Decimal },
    #[error("high {high} is below {field} {value}")]
    HighBelow {
        high: Decimal,
        field: &'static str,
        value: Decimal,
    },
    #[error("low {low} is above {field} {value}")]
    LowAbove {
        low: Decimal,
        field: &'static str,
        value: Decimal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Candle,
    Funding,
    OpenInterest,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Candle => "candle",
            RecordKind::Funding => "funding",
            RecordKind::OpenInterest => "open_interest",
        }
    }
}

/// Truncate a timestamp to the start of its minute.
pub fn truncate_to_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    let secs = time.timestamp().div_euclid(60) * 60;
    DateTime::from_timestamp(secs, 0).unwrap_or(time)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub topic: TopicId,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub num_trades: Option<i32>,
}

impl Candle {
    pub fn validate(&self) -> Result<(), ValidationError> {
        positive("open", self.open)?;
        positive("high", self.high)?;
        positive("low", self.low)?;
        positive("close", self.close)?;
        non_negative("volume", self.volume)?;

        for (field, value) in [("open", self.open), ("close", self.close), ("low", self.low)] {
            if self.high < value {
                return Err(ValidationError::HighBelow {
                    high: self.high,
                    field,
                    value,
                });
            }
        }
        for (field, value) in [("open", self.open), ("close", self.close), ("high", self.high)] {
            if self.low > value {
                return Err(ValidationError::LowAbove {
                    low: self.low,
                    field,
                    value,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub time: DateTime<Utc>,
    pub pair: PairId,
    pub funding_rate: Decimal,
    pub premium: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub oracle_price: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
}

impl FundingSnapshot {
    /// Funding rates and premiums may be negative; only the prices are checked.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("mark_price", self.mark_price),
            ("index_price", self.index_price),
            ("oracle_price", self.oracle_price),
            ("mid_price", self.mid_price),
        ] {
            if let Some(value) = value {
                positive(field, value)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestSnapshot {
    pub time: DateTime<Utc>,
    pub pair: PairId,
    pub open_interest: Decimal,
    pub notional_value: Option<Decimal>,
    pub day_base_volume: Option<Decimal>,
    pub day_notional_volume: Option<Decimal>,
}

impl OpenInterestSnapshot {
    pub fn validate(&self) -> Result<(), ValidationError> {
        non_negative("open_interest", self.open_interest)?;
        for (field, value) in [
            ("notional_value", self.notional_value),
            ("day_base_volume", self.day_base_volume),
            ("day_notional_volume", self.day_notional_volume),
        ] {
            if let Some(value) = value {
                non_negative(field, value)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Candle(Candle),
    Funding(FundingSnapshot),
    OpenInterest(OpenInterestSnapshot),
}

impl CanonicalRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            CanonicalRecord::Candle(_) => RecordKind::Candle,
            CanonicalRecord::Funding(_) => RecordKind::Funding,
            CanonicalRecord::OpenInterest(_) => RecordKind::OpenInterest,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            CanonicalRecord::Candle(c) => c.time,
            CanonicalRecord::Funding(f) => f.time,
            CanonicalRecord::OpenInterest(o) => o.time,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            CanonicalRecord::Candle(c) => c.validate(),
            CanonicalRecord::Funding(f) => f.validate(),
            CanonicalRecord::OpenInterest(o) => o.validate(),
        }
    }
}

fn positive(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value <= Decimal::ZERO {
        return Err(ValidationError::NonPositive { field, value });
    }
    Ok(())
}

fn non_negative(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value < Decimal::ZERO {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}
