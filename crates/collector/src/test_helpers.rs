//! Scripted adapter for runner and orchestrator tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tickhub_schema::{PairId, Topic, TopicId};

use crate::error::CollectorError;
use crate::traits::{CollectContext, StreamAdapter};

pub fn topic(id: i32, pair: i32, exchange: &str, base: &str, interval: &str) -> Topic {
    Topic {
        id: TopicId(id),
        pair_id: PairId(pair),
        exchange: exchange.to_string(),
        base: base.to_string(),
        quote: "USD".to_string(),
        market_type: "perps".to_string(),
        interval: interval.to_string(),
    }
}

/// What the adapter does on its next connect/collect cycle.
/// Once the script runs out every connect fails.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    FailConnect,
    CollectError,
    CollectUntilStop,
    /// Ignores the stop signal entirely
    CollectForever,
}

#[derive(Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    /// Streams that stayed up until stopped; a failing collect is not counted
    pub collecting: AtomicUsize,
    pub topics: AtomicUsize,
}

pub struct ScriptedAdapter {
    script: VecDeque<Step>,
    current: Option<Step>,
    counters: Arc<Counters>,
}

impl ScriptedAdapter {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: script.into(),
            current: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl StreamAdapter for ScriptedAdapter {
    fn exchange(&self) -> &str {
        "hyperliquid"
    }

    fn initialize(&mut self, topics: Vec<Topic>) {
        self.counters.topics.store(topics.len(), Ordering::SeqCst);
    }

    async fn connect(&mut self) -> Result<(), CollectorError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.script.pop_front().unwrap_or(Step::FailConnect);
        if let Step::FailConnect = step {
            return Err(CollectorError::ConnectionFailed("connection refused".to_string()));
        }
        self.current = Some(step);
        Ok(())
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<(), CollectorError> {
        match self.current.take() {
            Some(Step::CollectUntilStop) => {
                self.counters.collecting.fetch_add(1, Ordering::SeqCst);
                ctx.stopped().await;
                Ok(())
            }
            Some(Step::CollectForever) => {
                self.counters.collecting.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                Ok(())
            }
            _ => Err(CollectorError::Disconnected("stream reset".to_string())),
        }
    }

    async fn disconnect(&mut self) {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
