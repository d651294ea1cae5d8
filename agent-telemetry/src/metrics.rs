//! Counter, gauge, and histogram registry.
//!
//! Metrics are identified by `(name, labels)`. Call sites are expected to
//! call `get_or_create_*` once per event rather than caching handles, so
//! creation is idempotent and runs in a single critical section.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TelemetryError, TelemetryResult, recover, validate_name};
use crate::stats::Summary;

/// Label set attached to a metric. Ordering is irrelevant to identity.
pub type Labels = BTreeMap<String, String>;

/// Upper bounds used when a histogram is created without explicit buckets.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn to_labels(labels: &[(&str, &str)]) -> Labels {
    labels
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// Kind of a registered metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Arbitrary value.
    Gauge,
    /// Distribution of observations.
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        })
    }
}

#[derive(Debug)]
struct MetricMeta {
    name: String,
    description: String,
    labels: Labels,
}

/// `f64` stored as raw bits so updates are lock-free and never lost.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug)]
struct CounterInner {
    meta: MetricMeta,
    value: AtomicF64,
}

/// Monotonically non-decreasing counter handle.
///
/// Clones share the same underlying value.
#[derive(Debug, Clone)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

impl Counter {
    fn new(meta: MetricMeta) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                meta,
                value: AtomicF64::default(),
            }),
        }
    }

    /// Adds one.
    pub fn inc(&self) {
        self.inner.value.add(1.0);
    }

    /// Adds `amount`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for negative or non-finite
    /// amounts; the value is left unchanged.
    pub fn inc_by(&self, amount: f64) -> TelemetryResult<()> {
        if !amount.is_finite() || amount < 0.0 {
            warn!(metric = %self.inner.meta.name, amount, "rejected counter increment");
            return Err(TelemetryError::invalid_argument(format!(
                "counter `{}` cannot be incremented by {amount}",
                self.inner.meta.name
            )));
        }
        self.inner.value.add(amount);
        Ok(())
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> f64 {
        self.inner.value.load()
    }

    /// Resets the counter to zero.
    pub fn reset(&self) {
        self.inner.value.store(0.0);
    }

    /// Returns the metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.meta.name
    }

    /// Returns the label set.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.inner.meta.labels
    }

    /// Returns `true` when both handles refer to the same registered counter.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug)]
struct GaugeInner {
    meta: MetricMeta,
    value: AtomicF64,
}

/// Gauge handle holding an arbitrary value.
#[derive(Debug, Clone)]
pub struct Gauge {
    inner: Arc<GaugeInner>,
}

impl Gauge {
    fn new(meta: MetricMeta) -> Self {
        Self {
            inner: Arc::new(GaugeInner {
                meta,
                value: AtomicF64::default(),
            }),
        }
    }

    /// Adds one.
    pub fn inc(&self) {
        self.inc_by(1.0);
    }

    /// Subtracts one.
    pub fn dec(&self) {
        self.dec_by(1.0);
    }

    /// Adds `amount`, which may be negative.
    pub fn inc_by(&self, amount: f64) {
        self.inner.value.add(amount);
    }

    /// Subtracts `amount`.
    pub fn dec_by(&self, amount: f64) {
        self.inner.value.add(-amount);
    }

    /// Overwrites the value.
    pub fn set(&self, value: f64) {
        self.inner.value.store(value);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> f64 {
        self.inner.value.load()
    }

    /// Returns the metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.meta.name
    }

    /// Returns the label set.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.inner.meta.labels
    }
}

/// Construction options for histograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHistogramOptions")]
pub struct HistogramOptions {
    buckets: Vec<f64>,
    allow_negative: bool,
}

#[derive(Deserialize)]
struct RawHistogramOptions {
    buckets: Vec<f64>,
    #[serde(default)]
    allow_negative: bool,
}

impl TryFrom<RawHistogramOptions> for HistogramOptions {
    type Error = TelemetryError;

    fn try_from(raw: RawHistogramOptions) -> Result<Self, Self::Error> {
        let options = Self::new(raw.buckets)?;
        Ok(if raw.allow_negative {
            options.allow_negative()
        } else {
            options
        })
    }
}

impl HistogramOptions {
    /// Creates options with the supplied bucket upper bounds.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] unless the bounds are
    /// finite and strictly increasing.
    pub fn new(buckets: Vec<f64>) -> TelemetryResult<Self> {
        if buckets.iter().any(|b| !b.is_finite()) {
            return Err(TelemetryError::invalid_argument(
                "histogram buckets must be finite",
            ));
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TelemetryError::invalid_argument(
                "histogram buckets must be strictly increasing",
            ));
        }
        Ok(Self {
            buckets,
            allow_negative: false,
        })
    }

    /// Accepts negative observations. Durations and sizes should leave this off.
    #[must_use]
    pub fn allow_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }

    /// Returns the bucket upper bounds.
    #[must_use]
    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }
}

impl Default for HistogramOptions {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS.to_vec(),
            allow_negative: false,
        }
    }
}

#[derive(Debug, Default)]
struct HistogramState {
    samples: Vec<f64>,
    // One slot per bucket plus a trailing overflow slot.
    bucket_counts: Vec<u64>,
}

#[derive(Debug)]
struct HistogramInner {
    meta: MetricMeta,
    options: HistogramOptions,
    state: Mutex<HistogramState>,
}

/// Histogram handle retaining every observation.
#[derive(Debug, Clone)]
pub struct Histogram {
    inner: Arc<HistogramInner>,
}

/// Count of observations that fell into one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketCount {
    /// Inclusive upper bound; `None` is the overflow bucket.
    pub le: Option<f64>,
    /// Observations counted in this bucket.
    pub count: u64,
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Descriptive statistics, absent while no samples have been observed.
    pub summary: Option<Summary>,
    /// Per-bucket counts.
    pub buckets: Vec<BucketCount>,
}

impl Histogram {
    fn new(meta: MetricMeta, options: HistogramOptions) -> Self {
        let state = HistogramState {
            samples: Vec::new(),
            bucket_counts: vec![0; options.buckets.len() + 1],
        };
        Self {
            inner: Arc::new(HistogramInner {
                meta,
                options,
                state: Mutex::new(state),
            }),
        }
    }

    /// Records an observation.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for `NaN`, infinities, and
    /// negative values unless the histogram was built with
    /// [`HistogramOptions::allow_negative`].
    pub fn observe(&self, value: f64) -> TelemetryResult<()> {
        if !value.is_finite() || (value < 0.0 && !self.inner.options.allow_negative) {
            warn!(metric = %self.inner.meta.name, value, "rejected histogram observation");
            return Err(TelemetryError::invalid_argument(format!(
                "histogram `{}` cannot observe {value}",
                self.inner.meta.name
            )));
        }

        let slot = self
            .inner
            .options
            .buckets
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.inner.options.buckets.len());

        let mut state = recover(self.inner.state.lock());
        state.samples.push(value);
        state.bucket_counts[slot] += 1;
        Ok(())
    }

    /// Returns the number of observations.
    #[must_use]
    pub fn count(&self) -> usize {
        recover(self.inner.state.lock()).samples.len()
    }

    /// Computes statistics over all observations so far.
    #[must_use]
    pub fn summary(&self) -> Option<Summary> {
        let samples = recover(self.inner.state.lock()).samples.clone();
        Summary::from_samples(&samples)
    }

    /// Returns a copy of the statistics and bucket counts.
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let (samples, counts) = {
            let state = recover(self.inner.state.lock());
            (state.samples.clone(), state.bucket_counts.clone())
        };
        let bounds = self.inner.options.buckets.iter().copied().map(Some);
        let buckets = bounds
            .chain(std::iter::once(None))
            .zip(counts)
            .map(|(le, count)| BucketCount { le, count })
            .collect();
        HistogramSnapshot {
            summary: Summary::from_samples(&samples),
            buckets,
        }
    }

    /// Returns the metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.meta.name
    }

    /// Returns the label set.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.inner.meta.labels
    }
}

/// Any registered metric.
#[derive(Debug, Clone)]
pub enum Metric {
    /// A counter.
    Counter(Counter),
    /// A gauge.
    Gauge(Gauge),
    /// A histogram.
    Histogram(Histogram),
}

impl Metric {
    /// Returns the metric kind.
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram(_) => MetricKind::Histogram,
        }
    }

    fn meta(&self) -> &MetricMeta {
        match self {
            Self::Counter(c) => &c.inner.meta,
            Self::Gauge(g) => &g.inner.meta,
            Self::Histogram(h) => &h.inner.meta,
        }
    }

    /// Copies the current state into an owned snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricSnapshot {
        let meta = self.meta();
        let value = match self {
            Self::Counter(c) => MetricValue::Counter(c.get()),
            Self::Gauge(g) => MetricValue::Gauge(g.get()),
            Self::Histogram(h) => MetricValue::Histogram(h.snapshot()),
        };
        MetricSnapshot {
            name: meta.name.clone(),
            description: meta.description.clone(),
            labels: meta.labels.clone(),
            value,
        }
    }
}

/// Exported value of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    /// Counter total.
    Counter(f64),
    /// Gauge reading.
    Gauge(f64),
    /// Histogram statistics.
    Histogram(HistogramSnapshot),
}

/// Owned copy of a metric, suitable for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Metric family name.
    pub name: String,
    /// Help text supplied at creation.
    pub description: String,
    /// Label set identifying this instance within the family.
    pub labels: Labels,
    /// Current value.
    pub value: MetricValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricKey {
    name: String,
    labels: Labels,
}

/// Owns every metric instance keyed by `(name, labels)`.
#[derive(Debug)]
pub struct MetricsRegistry {
    metrics: RwLock<HashMap<MetricKey, Metric>>,
    default_histogram: HistogramOptions,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_histogram_options(HistogramOptions::default())
    }

    /// Creates an empty registry whose histograms default to `options`.
    #[must_use]
    pub fn with_histogram_options(options: HistogramOptions) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            default_histogram: options,
        }
    }

    /// Returns the counter for `(name, labels)`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for an invalid name or when
    /// the identity is already registered as another kind.
    pub fn get_or_create_counter(
        &self,
        name: &str,
        description: &str,
        labels: &[(&str, &str)],
    ) -> TelemetryResult<Counter> {
        let metric = self.get_or_create(name, description, labels, MetricKind::Counter, |meta| {
            Metric::Counter(Counter::new(meta))
        })?;
        match metric {
            Metric::Counter(counter) => Ok(counter),
            other => Err(kind_mismatch(name, MetricKind::Counter, other.kind())),
        }
    }

    /// Returns the gauge for `(name, labels)`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Same conditions as [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn get_or_create_gauge(
        &self,
        name: &str,
        description: &str,
        labels: &[(&str, &str)],
    ) -> TelemetryResult<Gauge> {
        let metric = self.get_or_create(name, description, labels, MetricKind::Gauge, |meta| {
            Metric::Gauge(Gauge::new(meta))
        })?;
        match metric {
            Metric::Gauge(gauge) => Ok(gauge),
            other => Err(kind_mismatch(name, MetricKind::Gauge, other.kind())),
        }
    }

    /// Returns the histogram for `(name, labels)` using the registry's
    /// default buckets.
    ///
    /// # Errors
    ///
    /// Same conditions as [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn get_or_create_histogram(
        &self,
        name: &str,
        description: &str,
        labels: &[(&str, &str)],
    ) -> TelemetryResult<Histogram> {
        let options = self.default_histogram.clone();
        self.get_or_create_histogram_with(name, description, labels, options)
    }

    /// Returns the histogram for `(name, labels)`. `options` only apply when
    /// the histogram does not exist yet.
    ///
    /// # Errors
    ///
    /// Same conditions as [`get_or_create_counter`](Self::get_or_create_counter).
    pub fn get_or_create_histogram_with(
        &self,
        name: &str,
        description: &str,
        labels: &[(&str, &str)],
        options: HistogramOptions,
    ) -> TelemetryResult<Histogram> {
        let metric = self.get_or_create(name, description, labels, MetricKind::Histogram, |meta| {
            Metric::Histogram(Histogram::new(meta, options))
        })?;
        match metric {
            Metric::Histogram(histogram) => Ok(histogram),
            other => Err(kind_mismatch(name, MetricKind::Histogram, other.kind())),
        }
    }

    fn get_or_create(
        &self,
        name: &str,
        description: &str,
        labels: &[(&str, &str)],
        kind: MetricKind,
        make: impl FnOnce(MetricMeta) -> Metric,
    ) -> TelemetryResult<Metric> {
        validate_name("metric", name)?;
        let key = MetricKey {
            name: name.to_owned(),
            labels: to_labels(labels),
        };

        let mut metrics = recover(self.metrics.write());
        if let Some(existing) = metrics.get(&key) {
            return Ok(existing.clone());
        }

        let metric = make(MetricMeta {
            name: key.name.clone(),
            description: description.to_owned(),
            labels: key.labels.clone(),
        });
        debug!(metric = name, %kind, labels = ?key.labels, "metric registered");
        metrics.insert(key, metric.clone());
        Ok(metric)
    }

    /// Looks up an existing metric.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotFound`] when nothing is registered under
    /// `(name, labels)`.
    pub fn get_metric(&self, name: &str, labels: &[(&str, &str)]) -> TelemetryResult<Metric> {
        let key = MetricKey {
            name: name.to_owned(),
            labels: to_labels(labels),
        };
        recover(self.metrics.read())
            .get(&key)
            .cloned()
            .ok_or_else(|| TelemetryError::not_found("metric", name))
    }

    /// Returns a point-in-time copy of every metric, ordered by name then labels.
    #[must_use]
    pub fn get_all_metrics(&self) -> Vec<MetricSnapshot> {
        let metrics: Vec<Metric> = recover(self.metrics.read()).values().cloned().collect();
        let mut snapshots: Vec<_> = metrics.iter().map(Metric::snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        snapshots
    }

    /// Number of registered metric instances.
    #[must_use]
    pub fn len(&self) -> usize {
        recover(self.metrics.read()).len()
    }

    /// Returns `true` when no metrics are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every metric. Outstanding handles keep working but are no
    /// longer reachable from the registry.
    pub fn clear(&self) {
        recover(self.metrics.write()).clear();
    }
}

fn kind_mismatch(name: &str, wanted: MetricKind, found: MetricKind) -> TelemetryError {
    TelemetryError::invalid_argument(format!(
        "metric `{name}` is registered as a {found}, not a {wanted}"
    ))
}
