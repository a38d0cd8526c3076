use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tickhub_store::TopicSource;

use crate::error::CollectorError;
use crate::health::{HealthHandle, LifecycleState};
use crate::metrics::CollectorMetrics;
use crate::traits::{CollectContext, StreamAdapter};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up; the collector makes
    /// `max_retries + 1` attempts in total.
    pub max_retries: u32,
    pub restart_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Supervises one stream adapter: connect, collect, back off and retry.
pub struct CollectorRunner {
    name: String,
    adapter: Box<dyn StreamAdapter>,
    topics: Arc<dyn TopicSource>,
    policy: RetryPolicy,
    health: HealthHandle,
    stop: CancellationToken,
    metrics: CollectorMetrics,
}

impl CollectorRunner {
    pub fn new(
        name: impl Into<String>,
        adapter: Box<dyn StreamAdapter>,
        topics: Arc<dyn TopicSource>,
        policy: RetryPolicy,
    ) -> Self {
        let name = name.into();
        let health = HealthHandle::new(name.clone(), adapter.exchange());
        Self {
            metrics: CollectorMetrics::new(name.clone()),
            name,
            adapter,
            topics,
            policy,
            health,
            stop: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health_handle(&self) -> HealthHandle {
        self.health.clone()
    }

    /// Cancelling this token asks the runner to stop at its next loop boundary
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn set_state(&self, state: LifecycleState) {
        self.health.set_state(state);
        self.metrics.set_state(state);
    }

    /// Load this collector's topics from the store.
    ///
    /// An unreachable store is an error. No topics is not: the collector
    /// runs idle.
    pub async fn initialize(&mut self) -> Result<usize, CollectorError> {
        let exchange = self.adapter.exchange().to_string();
        let topics = self.topics.active_topics(&exchange).await?;
        let count = topics.len();

        if count == 0 {
            warn!(collector = %self.name, exchange = %exchange, "No active topics configured, collector will idle");
        } else {
            info!(collector = %self.name, exchange = %exchange, topics = count, "Loaded topics");
        }

        self.health.set_topic_count(count);
        self.adapter.initialize(topics);
        Ok(count)
    }

    /// Run until stopped or the retry budget is exhausted.
    pub async fn run(&mut self) {
        let ctx = CollectContext::new(self.stop.clone(), self.health.activity_handle());
        let mut failures: u32 = 0;

        while !self.stop.is_cancelled() {
            self.set_state(LifecycleState::Starting);

            let result = match self.adapter.connect().await {
                Ok(()) => {
                    failures = 0;
                    self.health.reset_failures();
                    self.set_state(LifecycleState::Running);
                    info!(collector = %self.name, "Collector running");
                    self.adapter.collect(&ctx).await
                }
                Err(e) => Err(e),
            };

            // Always release the socket, whatever happened above
            self.adapter.disconnect().await;

            match result {
                Ok(()) if self.stop.is_cancelled() => break,
                Ok(()) => {
                    warn!(collector = %self.name, "Stream ended without a stop request, reconnecting");
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.inc_failure();
                    self.health.record_failure(failures, e.to_string());
                    self.set_state(LifecycleState::Error);

                    if failures > self.policy.max_retries {
                        error!(
                            collector = %self.name,
                            attempts = failures,
                            error = %e,
                            "Retry limit reached, collector stopped"
                        );
                        self.set_state(LifecycleState::Stopped);
                        return;
                    }
                    warn!(
                        collector = %self.name,
                        attempt = failures,
                        max_retries = self.policy.max_retries,
                        error = %e,
                        "Collector failed, retrying after delay"
                    );
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.policy.restart_delay) => {}
            }
        }

        self.set_state(LifecycleState::Stopping);
        info!(collector = %self.name, "Collector stopping");
        self.set_state(LifecycleState::Stopped);
    }
}
