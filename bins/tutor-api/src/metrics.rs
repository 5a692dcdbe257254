// Prometheus metrics for the tutor API

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec, IntCounterVec,
    IntGauge, TextEncoder,
};
use std::time::Duration;
use tracing::warn;

lazy_static! {
    static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tutor_executions_total",
        "Executions finished, by outcome",
        &["outcome"]
    )
    .expect("metric can be registered");
    static ref EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "tutor_execution_duration_seconds",
        "Wall-clock time from request to result, by outcome",
        &["outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0]
    )
    .expect("metric can be registered");
    static ref EXECUTIONS_IN_FLIGHT: IntGauge =
        register_int_gauge!("tutor_executions_in_flight", "Requests currently waiting on the engine")
            .expect("metric can be registered");
}

/// Outcome label for executions that produced no result.
pub const CANCELLED: &str = "cancelled";
pub const INFRASTRUCTURE_ERROR: &str = "infrastructure_error";

pub fn record_execution(outcome: &str, elapsed: Duration) {
    EXECUTIONS_TOTAL.with_label_values(&[outcome]).inc();
    EXECUTION_DURATION
        .with_label_values(&[outcome])
        .observe(elapsed.as_secs_f64());
}

/// Tracks one request in the in-flight gauge for as long as it lives.
pub struct InFlightGuard;

impl InFlightGuard {
    pub fn new() -> Self {
        EXECUTIONS_IN_FLIGHT.inc();
        Self
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        EXECUTIONS_IN_FLIGHT.dec();
    }
}

/// Everything in the default registry, in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_outcomes_are_rendered() {
        record_execution("success", Duration::from_millis(120));
        record_execution(CANCELLED, Duration::from_millis(30));

        let text = render();
        assert!(text.contains("tutor_executions_total{outcome=\"success\"}"));
        assert!(text.contains("tutor_executions_total{outcome=\"cancelled\"}"));
        assert!(text.contains("tutor_execution_duration_seconds_bucket"));
    }

    #[test]
    fn test_in_flight_guard_restores_gauge() {
        let before = EXECUTIONS_IN_FLIGHT.get();
        {
            let _guard = InFlightGuard::new();
            assert_eq!(EXECUTIONS_IN_FLIGHT.get(), before + 1);
        }
        assert_eq!(EXECUTIONS_IN_FLIGHT.get(), before);
    }
}
