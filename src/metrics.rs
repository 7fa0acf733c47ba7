//! Operation metrics
//!
//! Counters and latency histograms for the attach and replication entry
//! points, kept in a registry owned by this value and exported in the
//! Prometheus text format.

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Outcome label values
pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILURE: &str = "failure";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    operations: IntCounterVec,
    durations: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "array_driver_operations_total",
                "Driver operations by operation and outcome",
            ),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;

        let durations = HistogramVec::new(
            HistogramOpts::new(
                "array_driver_operation_duration_seconds",
                "Duration of driver operations",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]),
            &["operation"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(durations.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            durations,
        })
    }

    /// Record one finished operation
    pub fn observe(&self, operation: &str, success: bool, elapsed: Duration) {
        let outcome = if success { OUTCOME_SUCCESS } else { OUTCOME_FAILURE };
        self.operations.with_label_values(&[operation, outcome]).inc();
        self.durations
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Number of recorded operations with the given labels
    pub fn count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations.with_label_values(&[operation, outcome]).get()
    }

    /// Text exposition of every metric in the registry
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics.observe("create_mapping", true, Duration::from_millis(20));
        metrics.observe("create_mapping", false, Duration::from_millis(5));
        metrics.observe("create_mapping", true, Duration::from_millis(8));

        assert_eq!(metrics.count("create_mapping", OUTCOME_SUCCESS), 2);
        assert_eq!(metrics.count("create_mapping", OUTCOME_FAILURE), 1);

        let (content_type, body) = metrics.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("array_driver_operations_total"));
        assert!(text.contains("array_driver_operation_duration_seconds_bucket"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.observe("failover", true, Duration::from_secs(1));
        assert_eq!(b.count("failover", OUTCOME_SUCCESS), 0);
    }
}
