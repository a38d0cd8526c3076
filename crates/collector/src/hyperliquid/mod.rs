//! Hyperliquid stream adapters
//!
//! Candles are written as they arrive. Asset contexts (funding, open
//! interest) are buffered and flushed once a minute.

pub mod asset_ctx;
pub mod candles;
pub mod messages;
pub mod websocket;

pub use asset_ctx::{HyperliquidAssetContexts, MinuteBuffers};
pub use candles::HyperliquidCandles;
pub use messages::HyperliquidMessage;
pub use websocket::{HyperliquidWebSocket, HyperliquidWsError};
