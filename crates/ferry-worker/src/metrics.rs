//! Metrics for the consumer
//!
//! Recorded through the `metrics` facade; install any exporter to collect them.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one pass of a group's dispatch loop that selected a queue
pub fn record_dispatch_cycle(group: &str) {
    counter!(
        "ferry_dispatch_cycles_total",
        "group" => group.to_string()
    )
    .increment(1);
}

/// Record messages returned by a receive call
pub fn record_messages_fetched(queue: &str, count: usize) {
    counter!(
        "ferry_messages_fetched_total",
        "queue" => queue.to_string()
    )
    .increment(count as u64);
}

/// Record a finished unit of work
pub fn record_unit_processed(queue: &str, success: bool) {
    counter!(
        "ferry_units_processed_total",
        "queue" => queue.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

/// Record how long a handler (with its middleware) ran
pub fn record_unit_duration(queue: &str, duration: Duration) {
    histogram!(
        "ferry_unit_duration_seconds",
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update the busy processor gauge
pub fn set_busy_processors(group: &str, busy: usize) {
    gauge!(
        "ferry_busy_processors",
        "group" => group.to_string()
    )
    .set(busy as f64);
}

/// Record processors aborted by a hard shutdown
pub fn record_forced_cancellations(group: &str, count: usize) {
    counter!(
        "ferry_forced_cancellations_total",
        "group" => group.to_string()
    )
    .increment(count as u64);
}

/// Record a queue taken out of rotation
pub fn record_queue_paused(queue: &str) {
    counter!(
        "ferry_queue_pauses_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record a successful visibility extension
pub fn record_visibility_extended(queue: &str) {
    counter!(
        "ferry_visibility_extensions_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record messages deleted after successful processing
pub fn record_messages_deleted(queue: &str, count: usize) {
    counter!(
        "ferry_messages_deleted_total",
        "queue" => queue.to_string()
    )
    .increment(count as u64);
}
