use thiserror::Error;

use tickhub_store::StoreError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid notification: {0}")]
    InvalidPayload(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}
