/// Prometheus metrics for follow operations and counter reconciliation
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Follow/unfollow outcomes (labels: operation=follow|unfollow, status)
    pub static ref FOLLOW_OPERATIONS_TOTAL: CounterVec = register_counter_vec!(
        "follow_operations_total",
        "Total number of follow graph mutations by outcome",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref FOLLOW_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "follow_operation_duration_seconds",
        "Follow graph mutation latency in seconds",
        &["operation"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap();

    /// Counter recomputations (labels: result=unchanged|corrected|failed)
    pub static ref COUNTER_RECONCILIATIONS_TOTAL: CounterVec = register_counter_vec!(
        "counter_reconciliations_total",
        "Total number of counter recomputations by result",
        &["result"]
    )
    .unwrap();

    /// Sum of absolute counter corrections
    pub static ref COUNTER_DRIFT_CORRECTED_TOTAL: Counter = register_counter!(
        "counter_drift_corrected_total",
        "Total absolute drift corrected by reconciliation"
    )
    .unwrap();

    pub static ref COUNTER_DRIFT_QUEUE_SIZE: Gauge = register_gauge!(
        "counter_drift_queue_size",
        "Users waiting for counter reconciliation"
    )
    .unwrap();
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Records the outcome and latency of one follow graph mutation
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self, status: &str) {
        FOLLOW_OPERATIONS_TOTAL
            .with_label_values(&[self.operation, status])
            .inc();
        FOLLOW_OPERATION_DURATION_SECONDS
            .with_label_values(&[self.operation])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

pub fn record_reconciliation(result: &str, drift: i64) {
    COUNTER_RECONCILIATIONS_TOTAL
        .with_label_values(&[result])
        .inc();
    if drift > 0 {
        COUNTER_DRIFT_CORRECTED_TOTAL.inc_by(drift as f64);
    }
}

pub fn set_drift_queue_size(size: usize) {
    COUNTER_DRIFT_QUEUE_SIZE.set(size as f64);
}
