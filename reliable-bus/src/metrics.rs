//! Prometheus metrics for the reliability layer

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
};

lazy_static! {
    /// Publish calls by outcome
    pub static ref PUBLISH_TOTAL: CounterVec = register_counter_vec!(
        "reliable_bus_publish_total",
        "Total publish calls",
        &["status"]
    )
    .expect("publish counter registers once");

    /// Confirm synchronization points awaited
    pub static ref CONFIRM_BATCHES_TOTAL: Counter = register_counter!(
        "reliable_bus_confirm_batches_total",
        "Total publisher-confirm batches awaited"
    )
    .expect("confirm batch counter registers once");

    /// Deliveries by routing outcome
    pub static ref DELIVERY_TOTAL: CounterVec = register_counter_vec!(
        "reliable_bus_delivery_total",
        "Total deliveries by outcome",
        &["outcome"]
    )
    .expect("delivery counter registers once");

    /// Handler duration
    pub static ref HANDLER_DURATION: Histogram = register_histogram!(
        "reliable_bus_handler_duration_seconds",
        "Message handler duration in seconds"
    )
    .expect("handler histogram registers once");
}
