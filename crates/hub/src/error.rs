use thiserror::Error;

use tickhub_store::StoreError;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("send timed out")]
    SendTimeout,
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
