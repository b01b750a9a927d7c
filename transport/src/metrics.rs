//! Prometheus metrics for the transport

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

lazy_static! {
    /// Total messages sent
    pub static ref TRANSPORT_SEND_TOTAL: CounterVec = register_counter_vec!(
        "transport_send_total",
        "Total messages sent",
        &["interface", "status"]
    )
    .unwrap();

    /// Send duration
    pub static ref TRANSPORT_SEND_DURATION: HistogramVec = register_histogram_vec!(
        "transport_send_duration_seconds",
        "Message send duration in seconds",
        &["interface"]
    )
    .unwrap();

    /// Total messages received
    pub static ref TRANSPORT_RECEIVE_TOTAL: CounterVec = register_counter_vec!(
        "transport_receive_total",
        "Total messages received",
        &["interface", "status"]
    )
    .unwrap();

    /// Settlement outcomes (completed/abandoned/dead_lettered)
    pub static ref TRANSPORT_SETTLE_TOTAL: CounterVec = register_counter_vec!(
        "transport_settle_total",
        "Total message settlements",
        &["interface", "outcome"]
    )
    .unwrap();

    /// Dead-letter causes
    pub static ref TRANSPORT_DEAD_LETTER_TOTAL: CounterVec = register_counter_vec!(
        "transport_dead_letter_total",
        "Total messages dead-lettered",
        &["interface", "reason"]
    )
    .unwrap();
}
