// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the dispatch engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `telemetry_dispatch_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_ms` suffix for millisecond gauges
//!
//! # Labels
//! - `command`: command kind (`enqueue_event`, `flush`, ...)
//! - `table`: events, people, anonymous_people, groups
//! - `outcome`: delivered, discarded, retry

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Record a processed command
pub fn record_command(kind: &'static str) {
    counter!("telemetry_dispatch_commands_total", "command" => kind).increment(1);
}

/// Record a command dropped because its payload was malformed
pub fn record_malformed(kind: &'static str) {
    counter!("telemetry_dispatch_malformed_total", "command" => kind).increment(1);
}

/// Record a command dropped because the worker is dead
pub fn record_dropped_dead(kind: &'static str) {
    counter!("telemetry_dispatch_dropped_dead_total", "command" => kind).increment(1);
}

/// Record an automatic event skipped by the feature flag
pub fn record_automatic_skipped() {
    counter!("telemetry_dispatch_automatic_skipped_total").increment(1);
}

/// Record a stored record and the resulting queue depth
pub fn record_stored(table: &'static str, depth: usize) {
    counter!("telemetry_dispatch_records_stored_total", "table" => table).increment(1);
    gauge!("telemetry_dispatch_queue_depth", "table" => table).set(depth as f64);
}

/// Record an append refused for lack of space
pub fn record_out_of_memory(table: &'static str) {
    counter!("telemetry_dispatch_out_of_memory_total", "table" => table).increment(1);
}

/// Record one batch send attempt
pub fn record_batch(table: &'static str, outcome: &'static str, records: usize) {
    counter!(
        "telemetry_dispatch_batches_total",
        "table" => table,
        "outcome" => outcome
    )
    .increment(1);
    histogram!("telemetry_dispatch_batch_records", "table" => table).record(records as f64);
}

/// Set the delay chosen after a failed send
pub fn set_retry_delay(delay: Duration) {
    gauge!("telemetry_dispatch_retry_delay_ms").set(delay.as_millis() as f64);
}

/// Set the number of delayed flushes waiting in the scheduler
pub fn set_pending_flushes(count: usize) {
    gauge!("telemetry_dispatch_pending_flushes").set(count as f64);
}

/// Set the running average interval between flushes
pub fn set_flush_interval(average: Duration) {
    gauge!("telemetry_dispatch_flush_interval_ms").set(average.as_millis() as f64);
}

/// Record the worker dying
pub fn record_worker_death(reason: &'static str) {
    counter!("telemetry_dispatch_worker_deaths_total", "reason" => reason).increment(1);
}
