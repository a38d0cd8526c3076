use thiserror::Error;

use crate::hyperliquid::HyperliquidWsError;
use tickhub_store::StoreError;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("stream error: {0}")]
    Stream(#[from] HyperliquidWsError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
