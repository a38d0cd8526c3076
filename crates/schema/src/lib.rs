//! tickhub-schema: shared market data types
//!
//! Topic identifiers, canonical records with their invariants, and the JSON
//! messages exchanged with streaming clients.

pub mod record;
pub mod topic;
pub mod wire;

pub use record::{
    truncate_to_minute, Candle, CanonicalRecord, FundingSnapshot, OpenInterestSnapshot, RecordKind,
    ValidationError,
};
pub use topic::{PairId, Topic, TopicId};
pub use wire::{
    CandleData, CandleSeries, CandleUpdate, ErrorCode, FundingData, FundingSeries, FundingUpdate,
    OpenInterestData, OpenInterestSeries, OpenInterestUpdate, ServerMessage, TopicMeta,
};
