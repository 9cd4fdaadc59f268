//! Metrics module for billing-service.
//! Provides Prometheus metrics for provisioning actions, task queues and the invoice ledger.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Action dispatch attempts by extension and outcome
pub static ACTION_DISPATCH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Task outcomes by queue
pub static TASK_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Ledger events (invoice created, payment recorded, invoice paid)
pub static LEDGER_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Sweep runs by sweep and outcome
pub static SWEEP_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    ACTION_DISPATCH_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_action_dispatch_total",
                "Provisioning action dispatches by extension and outcome"
            ),
            &["extension", "outcome"]
        )
        .expect("Failed to register ACTION_DISPATCH_TOTAL")
    });

    TASK_OUTCOMES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_task_outcomes_total",
                "Task queue outcomes by queue (succeeded, retried, dropped, discarded)"
            ),
            &["queue", "outcome"]
        )
        .expect("Failed to register TASK_OUTCOMES_TOTAL")
    });

    LEDGER_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_ledger_events_total", "Invoice ledger events"),
            &["event"]
        )
        .expect("Failed to register LEDGER_EVENTS_TOTAL")
    });

    SWEEP_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_sweep_runs_total", "Overdue sweep runs"),
            &["sweep", "outcome"]
        )
        .expect("Failed to register SWEEP_RUNS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_action_dispatch(extension: &str, outcome: &str) {
    if let Some(counter) = ACTION_DISPATCH_TOTAL.get() {
        counter.with_label_values(&[extension, outcome]).inc();
    }
}

pub fn record_task_outcome(queue: &str, outcome: &str) {
    if let Some(counter) = TASK_OUTCOMES_TOTAL.get() {
        counter.with_label_values(&[queue, outcome]).inc();
    }
}

pub fn record_ledger_event(event: &str) {
    if let Some(counter) = LEDGER_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event]).inc();
    }
}

pub fn record_sweep_run(sweep: &str, outcome: &str) {
    if let Some(counter) = SWEEP_RUNS_TOTAL.get() {
        counter.with_label_values(&[sweep, outcome]).inc();
    }
}
