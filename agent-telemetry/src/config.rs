//! Construction options for [`Observability`](crate::Observability).
//!
//! Options are supplied by the host. Nothing here reads the environment;
//! hosts that keep settings in files can deserialize this type directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TelemetryResult, validate_name};
use crate::metrics::{DEFAULT_BUCKETS, HistogramOptions};
use crate::performance::DEFAULT_THROUGHPUT_BUCKET;

/// Service name used when none is supplied.
pub const DEFAULT_SERVICE_NAME: &str = "sdk";

/// Which subsystems to enable and how to size them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityOptions {
    service_name: String,
    enable_metrics: bool,
    enable_tracing: bool,
    enable_performance_monitoring: bool,
    enable_health_checks: bool,
    histogram_buckets: Vec<f64>,
    throughput_bucket: Duration,
}

impl ObservabilityOptions {
    /// Creates options for `service_name` with every subsystem enabled.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Enables or disables the metrics registry.
    #[must_use]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    /// Enables or disables span recording.
    #[must_use]
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    /// Enables or disables the performance monitor.
    #[must_use]
    pub fn with_performance_monitoring(mut self, enabled: bool) -> Self {
        self.enable_performance_monitoring = enabled;
        self
    }

    /// Enables or disables health checks.
    #[must_use]
    pub fn with_health_checks(mut self, enabled: bool) -> Self {
        self.enable_health_checks = enabled;
        self
    }

    /// Sets the default histogram bucket upper bounds.
    #[must_use]
    pub fn with_histogram_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.histogram_buckets = buckets;
        self
    }

    /// Sets the throughput bucket width.
    #[must_use]
    pub fn with_throughput_bucket(mut self, width: Duration) -> Self {
        self.throughput_bucket = width;
        self
    }

    /// Returns the service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns whether metrics are enabled.
    #[must_use]
    pub const fn metrics_enabled(&self) -> bool {
        self.enable_metrics
    }

    /// Returns whether tracing is enabled.
    #[must_use]
    pub const fn tracing_enabled(&self) -> bool {
        self.enable_tracing
    }

    /// Returns whether performance monitoring is enabled.
    #[must_use]
    pub const fn performance_monitoring_enabled(&self) -> bool {
        self.enable_performance_monitoring
    }

    /// Returns whether health checks are enabled.
    #[must_use]
    pub const fn health_checks_enabled(&self) -> bool {
        self.enable_health_checks
    }

    /// Returns the throughput bucket width.
    #[must_use]
    pub const fn throughput_bucket(&self) -> Duration {
        self.throughput_bucket
    }

    /// Validates the options, returning the histogram defaults they describe.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`](crate::TelemetryError::InvalidArgument)
    /// for an invalid service name, malformed buckets, or a zero throughput
    /// bucket.
    pub fn validate(&self) -> TelemetryResult<HistogramOptions> {
        validate_name("service", &self.service_name)?;
        if self.throughput_bucket.is_zero() {
            return Err(crate::TelemetryError::invalid_argument(
                "throughput bucket width must be greater than zero",
            ));
        }
        HistogramOptions::new(self.histogram_buckets.clone())
    }
}

impl Default for ObservabilityOptions {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            enable_metrics: true,
            enable_tracing: true,
            enable_performance_monitoring: true,
            enable_health_checks: true,
            histogram_buckets: DEFAULT_BUCKETS.to_vec(),
            throughput_bucket: DEFAULT_THROUGHPUT_BUCKET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_everything() {
        let options = ObservabilityOptions::default();
        assert_eq!(options.service_name(), "sdk");
        assert!(options.metrics_enabled());
        assert!(options.tracing_enabled());
        assert!(options.performance_monitoring_enabled());
        assert!(options.health_checks_enabled());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let options: ObservabilityOptions =
            serde_json::from_str(r#"{"service_name":"planner","enable_tracing":false}"#).unwrap();
        assert_eq!(options.service_name(), "planner");
        assert!(!options.tracing_enabled());
        assert!(options.metrics_enabled());
        assert_eq!(options.throughput_bucket(), DEFAULT_THROUGHPUT_BUCKET);
    }

    #[test]
    fn invalid_options_are_rejected() {
        assert!(ObservabilityOptions::new("").validate().is_err());
        assert!(
            ObservabilityOptions::default()
                .with_histogram_buckets(vec![1.0, 0.5])
                .validate()
                .is_err()
        );
        assert!(
            ObservabilityOptions::default()
                .with_throughput_bucket(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
