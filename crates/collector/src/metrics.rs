//! Prometheus metrics for the collectors
//!
//! Per-collector counters for inbound messages, stored and dropped records,
//! and the lifecycle state gauge.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

use crate::health::LifecycleState;

const LABEL_COLLECTOR: &str = "collector";
const LABEL_CHANNEL: &str = "channel";
const LABEL_KIND: &str = "kind";
const LABEL_REASON: &str = "reason";

/// Inbound stream messages per collector and channel
static MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_collector_messages_total",
        "Total stream messages received by the collector",
        &[LABEL_COLLECTOR, LABEL_CHANNEL]
    )
    .expect("Failed to register messages_total metric")
});

/// Records written to the store per collector and record kind
static RECORDS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_collector_records_written_total",
        "Records upserted into the store",
        &[LABEL_COLLECTOR, LABEL_KIND]
    )
    .expect("Failed to register records_written_total metric")
});

/// Records dropped before or during storage
static RECORDS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_collector_records_dropped_total",
        "Records dropped by the collector",
        &[LABEL_COLLECTOR, LABEL_KIND, LABEL_REASON]
    )
    .expect("Failed to register records_dropped_total metric")
});

/// Failed lifecycle iterations per collector
static FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_collector_failures_total",
        "Collector connect/collect failures",
        &[LABEL_COLLECTOR]
    )
    .expect("Failed to register failures_total metric")
});

/// Lifecycle state (0=idle 1=starting 2=running 3=error 4=stopping 5=stopped)
static LIFECYCLE_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tickhub_collector_state",
        "Collector lifecycle state",
        &[LABEL_COLLECTOR]
    )
    .expect("Failed to register collector_state metric")
});

/// Why a record never reached the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Invalid,
    UnknownTopic,
    WriteFailed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Invalid => "invalid",
            DropReason::UnknownTopic => "unknown_topic",
            DropReason::WriteFailed => "write_failed",
        }
    }
}

/// Handle for recording metrics for one collector
#[derive(Clone)]
pub struct CollectorMetrics {
    collector: String,
}

impl CollectorMetrics {
    pub fn new(collector: impl Into<String>) -> Self {
        Self {
            collector: collector.into(),
        }
    }

    pub fn inc_message(&self, channel: &str) {
        MESSAGES_TOTAL
            .with_label_values(&[&self.collector, channel])
            .inc();
    }

    pub fn add_written(&self, kind: &str, count: u64) {
        RECORDS_WRITTEN
            .with_label_values(&[&self.collector, kind])
            .inc_by(count);
    }

    pub fn add_dropped(&self, kind: &str, reason: DropReason, count: u64) {
        RECORDS_DROPPED
            .with_label_values(&[&self.collector, kind, reason.as_str()])
            .inc_by(count);
    }

    pub fn dropped(&self, kind: &str, reason: DropReason) -> u64 {
        RECORDS_DROPPED
            .with_label_values(&[&self.collector, kind, reason.as_str()])
            .get()
    }

    pub fn inc_failure(&self) {
        FAILURES_TOTAL.with_label_values(&[&self.collector]).inc();
    }

    pub fn set_state(&self, state: LifecycleState) {
        LIFECYCLE_STATE
            .with_label_values(&[&self.collector])
            .set(state.as_gauge());
    }
}

/// Encode all registered metrics in Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
