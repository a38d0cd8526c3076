use serde::{Deserialize, Serialize};
use std::fmt;

/// Fine-grained topic: one (exchange, base, quote, market type, interval) stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub i32);

/// Coarse topic: the interval-independent trading pair shared by several topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairId(pub i32);

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subscribable topic together with its descriptive metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub pair_id: PairId,
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub market_type: String,
    pub interval: String,
}

impl Topic {
    /// "BTC/USD" style pair label
    pub fn trading_pair(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trading_pair_label() {
        let topic = Topic {
            id: TopicId(7),
            pair_id: PairId(3),
            exchange: "hyperliquid".to_string(),
            base: "BTC".to_string(),
            quote: "USD".to_string(),
            market_type: "perps".to_string(),
            interval: "1m".to_string(),
        };
        assert_eq!(topic.trading_pair(), "BTC/USD");
    }

    #[test]
    fn test_ids_serialize_as_plain_integers() {
        assert_eq!(serde_json::to_string(&TopicId(5)).unwrap(), "5");
        let pair: PairId = serde_json::from_str("12").unwrap();
        assert_eq!(pair, PairId(12));
    }
}
