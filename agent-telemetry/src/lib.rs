//! Observability core for agents: metrics, span tracing, performance
//! monitoring, and health checks.
//!
//! Build one [`Observability`] per process at startup and hand clones of it
//! to every producer. Producers record events; exporters read
//! [`Observability::get_full_status`] and translate it to their own format.

#![warn(missing_docs, clippy::pedantic)]

pub mod config;
mod error;
pub mod health;
pub mod metrics;
pub mod performance;
pub mod stats;
pub mod tracing_support;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

pub use config::ObservabilityOptions;
pub use error::{TelemetryError, TelemetryResult};
pub use health::{
    HealthCheck, HealthCheckResult, HealthChecker, HealthOverview, HealthProbe, HealthReport,
    HealthStatus,
};
pub use metrics::{
    Counter, Gauge, Histogram, HistogramOptions, Metric, MetricKind, MetricSnapshot,
    MetricValue, MetricsRegistry,
};
pub use performance::{
    LatencySample, OperationToken, PerformanceMonitor, PerformanceSnapshot, ThroughputStats,
};
pub use stats::Summary;
pub use tracing_support::{
    LogLevel, SpanGuard, SpanHandle, SpanSnapshot, TagValue, TraceContext, Tracer,
    TracingSummary,
};

/// Span counts plus every recorded span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracingStatus {
    /// Aggregate counts.
    #[serde(flatten)]
    pub summary: TracingSummary,
    /// Every recorded span in start order.
    pub spans: Vec<SpanSnapshot>,
}

/// Snapshot of every enabled subsystem. Disabled subsystems are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservabilityStatus {
    /// Service the snapshot describes.
    pub service_name: String,
    /// Wall-clock time the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Metric snapshots.
    pub metrics: Option<Vec<MetricSnapshot>>,
    /// Span counts and spans.
    pub tracing: Option<TracingStatus>,
    /// Latency and throughput per operation.
    pub performance: Option<PerformanceSnapshot>,
    /// Last health check results.
    pub health: Option<HealthOverview>,
}

impl ObservabilityStatus {
    /// Converts the snapshot into a JSON value for exporters.
    ///
    /// # Errors
    ///
    /// Propagates serialization failures from `serde_json`.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[derive(Debug)]
struct ObservabilityInner {
    service_name: String,
    metrics: Option<MetricsRegistry>,
    tracer: Option<Tracer>,
    performance: Option<PerformanceMonitor>,
    health: Option<HealthChecker>,
}

/// Facade owning the four subsystems for one service.
///
/// Cloning is cheap and every clone refers to the same subsystems.
#[derive(Debug, Clone)]
pub struct Observability {
    inner: Arc<ObservabilityInner>,
}

impl Observability {
    /// Builds the enabled subsystems.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] when `options` fail
    /// validation.
    pub fn new(options: &ObservabilityOptions) -> TelemetryResult<Self> {
        let histogram = options.validate()?;
        let service_name = options.service_name().to_owned();

        let metrics = options
            .metrics_enabled()
            .then(|| MetricsRegistry::with_histogram_options(histogram));
        let tracer = if options.tracing_enabled() {
            Some(Tracer::new(service_name.clone())?)
        } else {
            None
        };
        let performance = if options.performance_monitoring_enabled() {
            Some(PerformanceMonitor::with_bucket_width(
                options.throughput_bucket(),
            )?)
        } else {
            None
        };
        let health = options.health_checks_enabled().then(HealthChecker::new);

        info!(
            service = %service_name,
            metrics = metrics.is_some(),
            tracing = tracer.is_some(),
            performance = performance.is_some(),
            health = health.is_some(),
            "observability initialised"
        );

        Ok(Self {
            inner: Arc::new(ObservabilityInner {
                service_name,
                metrics,
                tracer,
                performance,
                health,
            }),
        })
    }

    /// Returns the service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Returns the metrics registry when enabled.
    #[must_use]
    pub fn metrics(&self) -> Option<&MetricsRegistry> {
        self.inner.metrics.as_ref()
    }

    /// Returns the tracer when enabled.
    #[must_use]
    pub fn tracer(&self) -> Option<&Tracer> {
        self.inner.tracer.as_ref()
    }

    /// Returns the performance monitor when enabled.
    #[must_use]
    pub fn performance(&self) -> Option<&PerformanceMonitor> {
        self.inner.performance.as_ref()
    }

    /// Returns the health checker when enabled.
    #[must_use]
    pub fn health(&self) -> Option<&HealthChecker> {
        self.inner.health.as_ref()
    }

    /// Snapshots of every metric, or `None` when metrics are disabled.
    #[must_use]
    pub fn get_metrics_summary(&self) -> Option<Vec<MetricSnapshot>> {
        self.metrics().map(MetricsRegistry::get_all_metrics)
    }

    /// Span counts and spans, or `None` when tracing is disabled.
    #[must_use]
    pub fn get_traces_summary(&self) -> Option<TracingStatus> {
        self.tracer().map(|tracer| TracingStatus {
            summary: tracer.summary(),
            spans: tracer.get_all_spans(),
        })
    }

    /// Per-operation statistics, or `None` when monitoring is disabled.
    #[must_use]
    pub fn get_performance_summary(&self) -> Option<PerformanceSnapshot> {
        self.performance().map(PerformanceMonitor::snapshot)
    }

    /// Last health results, or `None` when health checks are disabled.
    #[must_use]
    pub fn get_health_status(&self) -> Option<HealthOverview> {
        self.health().map(HealthChecker::get_status)
    }

    /// Snapshot of every subsystem for export.
    #[must_use]
    pub fn get_full_status(&self) -> ObservabilityStatus {
        ObservabilityStatus {
            service_name: self.inner.service_name.clone(),
            timestamp: Utc::now(),
            metrics: self.get_metrics_summary(),
            tracing: self.get_traces_summary(),
            performance: self.get_performance_summary(),
            health: self.get_health_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_subsystems_are_absent() {
        let options = ObservabilityOptions::new("agent")
            .with_tracing(false)
            .with_health_checks(false);
        let observability = Observability::new(&options).unwrap();

        assert!(observability.metrics().is_some());
        assert!(observability.performance().is_some());
        assert!(observability.tracer().is_none());
        assert!(observability.health().is_none());

        let status = observability.get_full_status();
        assert!(status.tracing.is_none());
        let json = status.to_json().unwrap();
        assert!(json["tracing"].is_null());
        assert!(json["health"].is_null());
        assert_eq!(json["service_name"], "agent");
    }

    #[test]
    fn clones_share_state() {
        let observability = Observability::new(&ObservabilityOptions::default()).unwrap();
        let clone = observability.clone();
        clone
            .metrics()
            .unwrap()
            .get_or_create_counter("events", "", &[])
            .unwrap()
            .inc();
        let metrics = observability.get_metrics_summary().unwrap();
        assert_eq!(metrics[0].value, MetricValue::Counter(1.0));
    }

    #[test]
    fn invalid_options_fail_construction() {
        assert!(Observability::new(&ObservabilityOptions::new(" ")).is_err());
    }
}
