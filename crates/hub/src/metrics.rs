//! Prometheus metrics for the broadcast hub

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

static CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("tickhub_hub_connections", "Currently admitted client connections")
        .expect("Failed to register connections metric")
});

static REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tickhub_hub_rejected_total",
        "Connections refused because the hub was at capacity"
    )
    .expect("Failed to register rejected_total metric")
});

/// Messages delivered, by outbound message type
static SENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickhub_hub_messages_sent_total",
        "Messages written to client connections",
        &["type"]
    )
    .expect("Failed to register messages_sent_total metric")
});

static BROADCASTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("tickhub_hub_broadcasts_total", "Broadcast calls with at least one subscriber")
        .expect("Failed to register broadcasts_total metric")
});

static SEND_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tickhub_hub_send_failures_total",
        "Failed writes that disconnected a client"
    )
    .expect("Failed to register send_failures_total metric")
});

pub fn set_connections(count: usize) {
    CONNECTIONS.set(count as i64);
}

pub fn inc_rejected() {
    REJECTED_TOTAL.inc();
}

pub fn inc_broadcast() {
    BROADCASTS_TOTAL.inc();
}

pub fn add_sent(message_type: &str, count: usize) {
    SENT_TOTAL
        .with_label_values(&[message_type])
        .inc_by(count as u64);
}

pub fn inc_send_failure() {
    SEND_FAILURES_TOTAL.inc();
}

/// Encode all registered metrics in Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e)))
}
