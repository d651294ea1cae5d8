//! Per-operation latency and throughput tracking.
//!
//! Throughput events are counted in fixed-width time buckets measured from
//! the monitor's creation. Rates are computed over the elapsed time since the
//! first event for an operation, floored at one bucket width so an
//! immediate query after a burst reports `count / bucket_width` instead of
//! extrapolating to an unbounded rate.
//!
//! Samples are retained for the life of the monitor.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TelemetryError, TelemetryResult, recover, validate_name};
use crate::stats::Summary;

/// Bucket width used when none is configured.
pub const DEFAULT_THROUGHPUT_BUCKET: Duration = Duration::from_secs(1);

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// One completed operation timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    /// Wall-clock completion time.
    pub timestamp: DateTime<Utc>,
    /// Measured duration.
    pub duration: Duration,
}

/// Throughput figures for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    /// Events counted in the reported period.
    pub total: u64,
    /// Seconds the rate was computed over.
    pub elapsed_secs: f64,
    /// `total / elapsed_secs`.
    pub rate_per_second: f64,
    /// Non-empty time buckets in the reported period.
    pub buckets: usize,
}

/// Latency and throughput statistics for every known operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// Latency statistics in seconds, per operation.
    pub latency: BTreeMap<String, Summary>,
    /// Throughput since first event, per operation.
    pub throughput: BTreeMap<String, ThroughputStats>,
}

#[derive(Debug)]
struct ThroughputRecord {
    first: Instant,
    total: u64,
    // Bucket index since monitor creation -> events.
    buckets: BTreeMap<u64, u64>,
}

#[derive(Debug, Default)]
struct OperationRecord {
    latencies: Vec<LatencySample>,
    in_flight: usize,
    throughput: Option<ThroughputRecord>,
}

/// In-progress timing returned by [`PerformanceMonitor::start_operation`].
///
/// Tokens are single use: [`PerformanceMonitor::end_operation`] consumes them.
#[derive(Debug)]
#[must_use = "an operation is only recorded when its token is ended"]
pub struct OperationToken {
    monitor: u64,
    name: String,
    started: Instant,
}

impl OperationToken {
    /// Returns the operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the time elapsed since the operation started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Records operation latencies and throughput.
#[derive(Debug)]
pub struct PerformanceMonitor {
    id: u64,
    epoch: Instant,
    bucket_width: Duration,
    operations: Mutex<HashMap<String, OperationRecord>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    /// Creates a monitor with one-second throughput buckets.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            epoch: Instant::now(),
            bucket_width: DEFAULT_THROUGHPUT_BUCKET,
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a monitor with the given throughput bucket width.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for a zero width.
    pub fn with_bucket_width(bucket_width: Duration) -> TelemetryResult<Self> {
        if bucket_width.is_zero() {
            return Err(TelemetryError::invalid_argument(
                "throughput bucket width must be greater than zero",
            ));
        }
        Ok(Self {
            bucket_width,
            ..Self::new()
        })
    }

    /// Returns the throughput bucket width.
    #[must_use]
    pub const fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    /// Starts timing `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for an invalid name.
    pub fn start_operation(&self, name: &str) -> TelemetryResult<OperationToken> {
        validate_name("operation", name)?;
        recover(self.operations.lock())
            .entry(name.to_owned())
            .or_default()
            .in_flight += 1;
        Ok(OperationToken {
            monitor: self.id,
            name: name.to_owned(),
            started: Instant::now(),
        })
    }

    /// Stops timing and records the sample, returning the measured duration.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] when the token was issued
    /// by a different monitor.
    pub fn end_operation(&self, token: OperationToken) -> TelemetryResult<Duration> {
        if token.monitor != self.id {
            return Err(TelemetryError::invalid_argument(format!(
                "operation `{}` was started on another monitor",
                token.name
            )));
        }
        let duration = token.started.elapsed();
        let mut operations = recover(self.operations.lock());
        let record = operations.entry(token.name).or_default();
        record.in_flight = record.in_flight.saturating_sub(1);
        record.latencies.push(LatencySample {
            timestamp: Utc::now(),
            duration,
        });
        Ok(duration)
    }

    /// Records an externally measured duration for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for an invalid name.
    pub fn record_latency(&self, name: &str, duration: Duration) -> TelemetryResult<()> {
        validate_name("operation", name)?;
        recover(self.operations.lock())
            .entry(name.to_owned())
            .or_default()
            .latencies
            .push(LatencySample {
                timestamp: Utc::now(),
                duration,
            });
        Ok(())
    }

    /// Starts timing `name`, recording the sample when the guard drops.
    ///
    /// # Errors
    ///
    /// Same as [`start_operation`](Self::start_operation).
    pub fn start_measure(&self, name: &str) -> TelemetryResult<MeasureGuard<'_>> {
        Ok(MeasureGuard {
            monitor: self,
            token: Some(self.start_operation(name)?),
        })
    }

    /// Times `f`, recording the sample on every exit path including unwinding.
    ///
    /// # Errors
    ///
    /// Returns an error only when timing could not start, in which case `f`
    /// is not run.
    pub fn measure<R>(&self, name: &str, f: impl FnOnce() -> R) -> TelemetryResult<R> {
        let guard = self.start_measure(name)?;
        let output = f();
        drop(guard);
        Ok(output)
    }

    /// Times `future`, recording the sample on completion or drop.
    ///
    /// # Errors
    ///
    /// Same as [`measure`](Self::measure).
    pub async fn measure_async<F>(&self, name: &str, future: F) -> TelemetryResult<F::Output>
    where
        F: Future,
    {
        let guard = self.start_measure(name)?;
        let output = future.await;
        drop(guard);
        Ok(output)
    }

    /// Adds `count` events to the current time bucket for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for an invalid name, a
    /// zero count, or a count that would overflow the running total. A
    /// rejected count is not recorded.
    pub fn record_throughput(&self, name: &str, count: u64) -> TelemetryResult<()> {
        validate_name("operation", name)?;
        if count == 0 {
            return Err(TelemetryError::invalid_argument(
                "throughput count must be at least 1",
            ));
        }
        let now = Instant::now();
        let bucket = self.bucket_index(now);
        let mut operations = recover(self.operations.lock());
        let record = operations
            .entry(name.to_owned())
            .or_default()
            .throughput
            .get_or_insert_with(|| ThroughputRecord {
                first: now,
                total: 0,
                buckets: BTreeMap::new(),
            });
        let Some(total) = record.total.checked_add(count) else {
            warn!(operation = name, count, "throughput total would overflow");
            return Err(TelemetryError::invalid_argument(format!(
                "throughput total for `{name}` would overflow"
            )));
        };
        record.total = total;
        // A bucket never exceeds the total, so this cannot overflow.
        *record.buckets.entry(bucket).or_default() += count;
        Ok(())
    }

    /// Latency statistics in seconds over every sample recorded for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotFound`] when no sample was recorded.
    pub fn get_latency_stats(&self, name: &str) -> TelemetryResult<Summary> {
        let seconds: Vec<f64> = {
            let operations = recover(self.operations.lock());
            operations
                .get(name)
                .map(|r| r.latencies.iter().map(|s| s.duration.as_secs_f64()).collect())
                .unwrap_or_default()
        };
        Summary::from_samples(&seconds).ok_or_else(|| TelemetryError::not_found("operation", name))
    }

    /// Returns a copy of the raw latency samples for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotFound`] when no sample was recorded.
    pub fn get_latency_samples(&self, name: &str) -> TelemetryResult<Vec<LatencySample>> {
        let operations = recover(self.operations.lock());
        match operations.get(name) {
            Some(record) if !record.latencies.is_empty() => Ok(record.latencies.clone()),
            _ => Err(TelemetryError::not_found("operation", name)),
        }
    }

    /// Event rate since the first event recorded for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotFound`] when no throughput was recorded.
    pub fn get_throughput_stats(&self, name: &str) -> TelemetryResult<ThroughputStats> {
        let operations = recover(self.operations.lock());
        let record = operations
            .get(name)
            .and_then(|r| r.throughput.as_ref())
            .ok_or_else(|| TelemetryError::not_found("operation", name))?;
        Ok(self.since_first(record, Instant::now()))
    }

    /// Event rate over the most recent `window`, or since the first event
    /// when that is shorter.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for a zero window and
    /// [`TelemetryError::NotFound`] when no throughput was recorded.
    pub fn get_throughput_stats_windowed(
        &self,
        name: &str,
        window: Duration,
    ) -> TelemetryResult<ThroughputStats> {
        if window.is_zero() {
            return Err(TelemetryError::invalid_argument(
                "throughput window must be greater than zero",
            ));
        }
        let now = Instant::now();
        let operations = recover(self.operations.lock());
        let record = operations
            .get(name)
            .and_then(|r| r.throughput.as_ref())
            .ok_or_else(|| TelemetryError::not_found("operation", name))?;

        let current = self.bucket_index(now);
        let span = self.buckets_in(window).max(1);
        let oldest = current.saturating_sub(span - 1);
        let (total, buckets) = record
            .buckets
            .range(oldest..)
            .fold((0u64, 0usize), |(total, buckets), (_, count)| {
                (total.saturating_add(*count), buckets + 1)
            });

        let elapsed = self.floored_elapsed(record, now).min(window);
        Ok(rate(total, elapsed, buckets))
    }

    /// Number of operations started but not yet ended for `name`.
    #[must_use]
    pub fn in_flight(&self, name: &str) -> usize {
        recover(self.operations.lock())
            .get(name)
            .map_or(0, |r| r.in_flight)
    }

    /// Names of every operation with recorded activity, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = recover(self.operations.lock()).keys().cloned().collect();
        names.sort();
        names
    }

    /// Computes latency and throughput statistics for every operation.
    #[must_use]
    pub fn snapshot(&self) -> PerformanceSnapshot {
        let now = Instant::now();
        let operations = recover(self.operations.lock());
        let mut snapshot = PerformanceSnapshot::default();
        for (name, record) in operations.iter() {
            let seconds: Vec<f64> = record
                .latencies
                .iter()
                .map(|s| s.duration.as_secs_f64())
                .collect();
            if let Some(summary) = Summary::from_samples(&seconds) {
                snapshot.latency.insert(name.clone(), summary);
            }
            if let Some(throughput) = &record.throughput {
                snapshot
                    .throughput
                    .insert(name.clone(), self.since_first(throughput, now));
            }
        }
        snapshot
    }

    /// Discards every sample.
    pub fn reset(&self) {
        let mut operations = recover(self.operations.lock());
        let in_flight: usize = operations.values().map(|r| r.in_flight).sum();
        if in_flight > 0 {
            warn!(in_flight, "performance monitor reset with operations in flight");
        }
        operations.clear();
        debug!("performance monitor reset");
    }

    fn since_first(&self, record: &ThroughputRecord, now: Instant) -> ThroughputStats {
        rate(
            record.total,
            self.floored_elapsed(record, now),
            record.buckets.len(),
        )
    }

    fn floored_elapsed(&self, record: &ThroughputRecord, now: Instant) -> Duration {
        now.saturating_duration_since(record.first)
            .max(self.bucket_width)
    }

    fn bucket_index(&self, at: Instant) -> u64 {
        self.buckets_in(at.saturating_duration_since(self.epoch))
    }

    fn buckets_in(&self, span: Duration) -> u64 {
        let index = span.as_nanos() / self.bucket_width.as_nanos();
        u64::try_from(index).unwrap_or(u64::MAX)
    }
}

fn rate(total: u64, elapsed: Duration, buckets: usize) -> ThroughputStats {
    let elapsed_secs = elapsed.as_secs_f64();
    #[allow(clippy::cast_precision_loss)]
    let rate_per_second = total as f64 / elapsed_secs;
    ThroughputStats {
        total,
        elapsed_secs,
        rate_per_second,
        buckets,
    }
}

/// Records an operation's duration when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard ends the measurement immediately"]
pub struct MeasureGuard<'a> {
    monitor: &'a PerformanceMonitor,
    token: Option<OperationToken>,
}

impl MeasureGuard<'_> {
    /// Ends the measurement now, returning the duration.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`PerformanceMonitor::end_operation`].
    pub fn finish(mut self) -> TelemetryResult<Duration> {
        match self.token.take() {
            Some(token) => self.monitor.end_operation(token),
            None => Err(TelemetryError::invalid_state("measurement already finished")),
        }
    }
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(err) = self.monitor.end_operation(token) {
                warn!(%err, "failed to record measurement");
            }
        }
    }
}
