use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

use tickhub_schema::Topic;

use crate::error::CollectorError;

/// Handed to `StreamAdapter::collect` by the runner.
///
/// Carries the cooperative stop signal and the last-write timestamp the
/// runner reports in its health snapshot.
#[derive(Clone)]
pub struct CollectContext {
    stop: CancellationToken,
    last_write_epoch_secs: Arc<AtomicU64>,
}

impl CollectContext {
    pub fn new(stop: CancellationToken, last_write_epoch_secs: Arc<AtomicU64>) -> Self {
        Self {
            stop,
            last_write_epoch_secs,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Record a successful store write
    pub fn record_write(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_write_epoch_secs.store(now, Ordering::SeqCst);
    }

    pub fn activity_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.last_write_epoch_secs)
    }
}

/// One exchange stream, driven by a `CollectorRunner`.
#[async_trait]
pub trait StreamAdapter: Send {
    /// Exchange whose topics this adapter owns
    fn exchange(&self) -> &str;

    /// Hand over the topics loaded from the store. Called before the first connect.
    fn initialize(&mut self, topics: Vec<Topic>);

    /// Open the stream and subscribe every owned topic
    async fn connect(&mut self) -> Result<(), CollectorError>;

    /// Process messages until stopped (Ok) or the stream fails (Err)
    async fn collect(&mut self, ctx: &CollectContext) -> Result<(), CollectorError>;

    /// Release the connection and all subscription state. Must be safe to call
    /// after a failed or partial connect.
    async fn disconnect(&mut self);
}
