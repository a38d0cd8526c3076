//! tickhub-collector-lib: exchange stream collectors
//!
//! A `StreamAdapter` owns one exchange stream. A `CollectorRunner` drives it
//! through connect, collect and disconnect with bounded retries, and the
//! `Orchestrator` starts and stops the runners as a group.

pub mod buffer;
pub mod error;
pub mod health;
pub mod hyperliquid;
pub mod metrics;
pub mod orchestrator;
pub mod runner;
pub mod server;
pub mod traits;

#[cfg(test)]
mod test_helpers;

pub use buffer::LatestValueBuffer;
pub use error::CollectorError;
pub use health::{CollectorHealth, HealthHandle, LifecycleState, OrchestratorHealth};
pub use hyperliquid::{HyperliquidAssetContexts, HyperliquidCandles};
pub use metrics::{encode_metrics, CollectorMetrics, DropReason};
pub use orchestrator::{HealthView, Orchestrator};
pub use runner::{CollectorRunner, RetryPolicy};
pub use server::{create_router, run_server};
pub use traits::{CollectContext, StreamAdapter};
