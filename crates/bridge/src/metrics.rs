//! Prometheus metrics for the change bridge

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

const LABEL_CHANNEL: &str = "channel";

static RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_bridge_notifications_total",
        "Change notifications received",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register notifications_total metric")
});

/// Notifications for topics nobody subscribes to
static SKIPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_bridge_skipped_total",
        "Notifications skipped without an enrichment query",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register skipped_total metric")
});

static FAILED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_bridge_failed_total",
        "Notifications whose enrichment or broadcast failed",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register failed_total metric")
});

/// Dropped because the worker queue was full
static DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_bridge_dropped_total",
        "Notifications dropped on a full worker queue",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register dropped_total metric")
});

static RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tickhub_bridge_reconnects_total",
        "Listener connection re-establishments"
    )
    .expect("Failed to register reconnects_total metric")
});

pub fn inc_received(channel: &str) {
    RECEIVED_TOTAL.with_label_values(&[channel]).inc();
}

pub fn inc_skipped(channel: &str) {
    SKIPPED_TOTAL.with_label_values(&[channel]).inc();
}

pub fn skipped(channel: &str) -> u64 {
    SKIPPED_TOTAL.with_label_values(&[channel]).get()
}

pub fn inc_failed(channel: &str) {
    FAILED_TOTAL.with_label_values(&[channel]).inc();
}

pub fn inc_dropped(channel: &str) {
    DROPPED_TOTAL.with_label_values(&[channel]).inc();
}

pub fn inc_reconnect() {
    RECONNECTS_TOTAL.inc();
}
