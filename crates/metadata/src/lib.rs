//! tickhub-metadata: environment configuration shared by the tickhub services

pub mod environment;
pub mod error;

pub use environment::{
    BridgeConfig, CollectorKind, CollectorSpec, CollectorsConfig, Environment, HubConfig,
    StoreConfig, HYPERLIQUID_WS_URL,
};
pub use error::MetadataError;
