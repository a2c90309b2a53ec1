//! Prometheus metrics for allocation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

/// Counter for allocation operations by operation and outcome.
pub static ALLOCATION_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_operations_total",
        "Total number of allocation operations",
        &["operation", "status"]
    )
    .expect("Failed to register ALLOCATION_OPERATIONS")
});

/// Money moved onto invoices, by allocation method.
pub static ALLOCATED_AMOUNT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_allocated_amount_total",
        "Total amount allocated to invoices",
        &["method"]
    )
    .expect("Failed to register ALLOCATED_AMOUNT")
});

/// Histogram for allocation duration by operation.
pub static ALLOCATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "allocation_operation_duration_seconds",
        "Allocation operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register ALLOCATION_DURATION")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "allocation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for drift computations by status (OK/WARN/FAIL/ERROR).
pub static DRIFT_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_drift_runs_total",
        "Total number of drift computations",
        &["status", "recorded"]
    )
    .expect("Failed to register DRIFT_RUNS")
});

/// Last observed drift ratio by scope kind.
pub static DRIFT_RATIO: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "allocation_drift_ratio",
        "Last observed legacy/ledger drift ratio",
        &["scope"]
    )
    .expect("Failed to register DRIFT_RATIO")
});

/// Counter for feature flag transitions.
pub static FLAG_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_flag_transitions_total",
        "Total number of feature flag state changes",
        &["flag", "state"]
    )
    .expect("Failed to register FLAG_TRANSITIONS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&ALLOCATION_OPERATIONS);
    Lazy::force(&ALLOCATED_AMOUNT);
    Lazy::force(&ALLOCATION_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&DRIFT_RUNS);
    Lazy::force(&DRIFT_RATIO);
    Lazy::force(&FLAG_TRANSITIONS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an allocation operation outcome.
pub fn record_allocation_operation(operation: &str, status: &str) {
    ALLOCATION_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record allocated money. Converted to f64 for the counter only.
pub fn record_allocated_amount(method: &str, amount: f64) {
    if amount > 0.0 {
        ALLOCATED_AMOUNT.with_label_values(&[method]).inc_by(amount);
    }
}

/// Record a drift computation. `scope` is a [`DriftScope::kind`](crate::models::DriftScope::kind).
pub fn record_drift_run(scope: &str, status: &str, recorded: bool, ratio: f64) {
    DRIFT_RUNS
        .with_label_values(&[status, if recorded { "true" } else { "false" }])
        .inc();
    DRIFT_RATIO.with_label_values(&[scope]).set(ratio);
}

/// Record a drift computation that could not complete.
pub fn record_drift_failure() {
    DRIFT_RUNS.with_label_values(&["ERROR", "false"]).inc();
}

/// Record a flag transition.
pub fn record_flag_transition(flag: &str, state: &str) {
    FLAG_TRANSITIONS.with_label_values(&[flag, state]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
