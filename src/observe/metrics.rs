//! Prometheus-compatible metrics for pipeline execution.
//!
//! Counters and histograms are registered once in the default registry and
//! recorded unconditionally; scraping them is the observer's business.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::time::Duration;

lazy_static! {
    /// Counter for process calls by connector kind and outcome.
    static ref PROCESSES: IntCounterVec = register_int_counter_vec!(
        "pipeflow_processes_total",
        "Total number of process calls",
        &["connector", "status"]
    ).unwrap();

    /// Histogram for process duration by connector kind.
    static ref PROCESS_DURATION: HistogramVec = register_histogram_vec!(
        "pipeflow_process_duration_seconds",
        "Process call duration in seconds",
        &["connector"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    /// Counter for circuit breaker transitions.
    static ref BREAKER_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "pipeflow_circuit_breaker_transitions_total",
        "Circuit breaker state transitions",
        &["from_state", "to_state"]
    ).unwrap();

    /// Counter for admission rejections (breaker open, limiter drop, pool full).
    static ref REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "pipeflow_rejections_total",
        "Calls refused before reaching a child",
        &["name", "kind"]
    ).unwrap();

    /// Counter for failed retry attempts.
    static ref RETRY_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "pipeflow_retry_attempts_total",
        "Failed attempts observed by retrying connectors",
        &["name"]
    ).unwrap();

    /// Counter for deadline expiries.
    static ref TIMEOUTS: IntCounterVec = register_int_counter_vec!(
        "pipeflow_timeouts_total",
        "Deadline expiries by connector name",
        &["name"]
    ).unwrap();

    /// Counter for race and contest outcomes.
    static ref RACE_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "pipeflow_race_outcomes_total",
        "Race and contest outcomes",
        &["name", "outcome"]
    ).unwrap();

    /// Counter for panics recovered at chainable boundaries.
    static ref PANICS: IntCounterVec = register_int_counter_vec!(
        "pipeflow_panics_recovered_total",
        "Panics recovered at chainable boundaries",
        &["name"]
    ).unwrap();
}

/// Record one process call.
pub fn record_process(connector: &str, status: &str, duration: Duration) {
    PROCESSES.with_label_values(&[connector, status]).inc();
    PROCESS_DURATION
        .with_label_values(&[connector])
        .observe(duration.as_secs_f64());
}

/// Record a circuit breaker state transition.
pub fn record_breaker_transition(from: &str, to: &str) {
    BREAKER_TRANSITIONS.with_label_values(&[from, to]).inc();
}

/// Record an admission rejection.
pub fn record_rejection(name: &str, kind: &str) {
    REJECTIONS.with_label_values(&[name, kind]).inc();
}

/// Record a failed attempt inside a retrying connector.
pub fn record_retry_attempt(name: &str) {
    RETRY_ATTEMPTS.with_label_values(&[name]).inc();
}

/// Record a deadline expiry.
pub fn record_timeout(name: &str) {
    TIMEOUTS.with_label_values(&[name]).inc();
}

/// Record a race or contest outcome (`winner`, `no_winner`, `canceled`).
pub fn record_race_outcome(name: &str, outcome: &str) {
    RACE_OUTCOMES.with_label_values(&[name, outcome]).inc();
}

/// Record a recovered panic.
pub fn record_panic(name: &str) {
    PANICS.with_label_values(&[name]).inc();
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_export() {
        record_process("sequence", "success", Duration::from_millis(3));
        record_breaker_transition("closed", "open");
        record_rejection("limiter", "rate_limit");
        record_retry_attempt("retry");
        record_timeout("timeout");
        record_race_outcome("race", "winner");
        record_panic("exploder");

        let exported = export_metrics().unwrap();
        assert!(exported.contains("pipeflow_processes_total"));
        assert!(exported.contains("pipeflow_circuit_breaker_transitions_total"));
        assert!(exported.contains("pipeflow_rejections_total"));
    }
}
