//! Caller-triggered health checks with per-probe timeouts.
//!
//! Each probe runs on its own tokio task bounded by its timeout, and
//! [`HealthChecker::run_all`] runs every probe concurrently, so the call
//! returns within roughly the largest configured timeout. Async probes are
//! aborted when they overrun. Blocking probes keep running on the blocking
//! pool, but the caller no longer waits for them.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TelemetryError, TelemetryResult, recover, validate_name};

/// Probe executed by a health check.
///
/// `Ok(true)` is healthy; `Ok(false)` and `Err(_)` are unhealthy, the
/// latter with its message recorded.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Runs the probe once.
    async fn check(&self) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> HealthProbe for F
where
    F: Send + Sync + Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn check(&self) -> anyhow::Result<bool> {
        (self)().await
    }
}

/// Named probe with a time budget.
#[derive(Clone)]
pub struct HealthCheck {
    name: String,
    timeout: Duration,
    probe: Arc<dyn HealthProbe>,
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("probe", &"dyn HealthProbe")
            .finish()
    }
}

impl HealthCheck {
    /// Creates a check around an async probe.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for an invalid name or a
    /// zero timeout.
    pub fn new<P>(name: impl Into<String>, timeout: Duration, probe: P) -> TelemetryResult<Self>
    where
        P: HealthProbe + 'static,
    {
        let name = name.into();
        validate_name("health check", &name)?;
        if timeout.is_zero() {
            return Err(TelemetryError::invalid_argument(format!(
                "health check `{name}` timeout must be greater than zero"
            )));
        }
        Ok(Self {
            name,
            timeout,
            probe: Arc::new(probe),
        })
    }

    /// Creates a check around a synchronous probe, run on the blocking pool.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn blocking<F>(name: impl Into<String>, timeout: Duration, probe: F) -> TelemetryResult<Self>
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let probe = Arc::new(probe);
        Self::new(name, timeout, move || {
            let probe = Arc::clone(&probe);
            async move {
                match tokio::task::spawn_blocking(move || (*probe)()).await {
                    Ok(outcome) => outcome,
                    Err(err) => Err(anyhow!("blocking probe failed: {err}")),
                }
            }
        })
    }

    /// Returns the check name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the time budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self) -> HealthCheckResult {
        let started = Instant::now();
        let probe = Arc::clone(&self.probe);
        let mut task = tokio::spawn(async move { probe.check().await });

        let (status, error) = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(true))) => (HealthStatus::Healthy, None),
            Ok(Ok(Ok(false))) => (HealthStatus::Unhealthy, None),
            Ok(Ok(Err(err))) => (HealthStatus::Unhealthy, Some(format!("{err:#}"))),
            Ok(Err(join)) if join.is_panic() => {
                (HealthStatus::Unhealthy, Some("probe panicked".to_owned()))
            }
            Ok(Err(_)) => (HealthStatus::Unhealthy, Some("probe cancelled".to_owned())),
            Err(_) => {
                task.abort();
                let err = TelemetryError::Timeout {
                    name: self.name.clone(),
                    timeout: self.timeout,
                };
                (HealthStatus::Unhealthy, Some(err.to_string()))
            }
        };

        let duration = started.elapsed();
        if status == HealthStatus::Unhealthy {
            warn!(check = %self.name, ?duration, error = ?error, "health check unhealthy");
        } else {
            debug!(check = %self.name, ?duration, "health check passed");
        }

        HealthCheckResult {
            name: self.name.clone(),
            status,
            timestamp: Utc::now(),
            duration,
            error,
        }
    }
}

/// Outcome of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Probe reported success within its budget.
    Healthy,
    /// Probe failed, errored, panicked, or timed out.
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Result of one probe execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name.
    pub name: String,
    /// Outcome.
    pub status: HealthStatus,
    /// Wall-clock completion time.
    pub timestamp: DateTime<Utc>,
    /// Time spent waiting for the probe.
    pub duration: Duration,
    /// Failure detail; `None` when healthy or when the probe returned `false`.
    pub error: Option<String>,
}

impl HealthCheckResult {
    /// Returns `true` for a healthy outcome.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Aggregate outcome of [`HealthChecker::run_all`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Healthy only if every check is healthy.
    pub status: HealthStatus,
    /// Per-check results.
    pub checks: BTreeMap<String, HealthCheckResult>,
    /// Wall-clock time the report was assembled.
    pub timestamp: DateTime<Utc>,
}

/// Registered check and its last outcome, without running the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatus {
    /// Configured time budget.
    pub timeout: Duration,
    /// Most recent result, `None` until first run.
    pub last_result: Option<HealthCheckResult>,
}

/// Last known state of every registered check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthOverview {
    /// Per-check state.
    pub checks: BTreeMap<String, CheckStatus>,
    /// Wall-clock time the overview was assembled.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    check: HealthCheck,
    last_result: Option<HealthCheckResult>,
}

/// Registry of named health checks.
#[derive(Debug, Default)]
pub struct HealthChecker {
    checks: RwLock<BTreeMap<String, Entry>>,
}

impl HealthChecker {
    /// Creates an empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `check`, replacing any check with the same name.
    pub fn register(&self, check: HealthCheck) {
        let name = check.name.clone();
        let previous = recover(self.checks.write()).insert(
            name.clone(),
            Entry {
                check,
                last_result: None,
            },
        );
        if previous.is_some() {
            debug!(check = %name, "health check replaced");
        } else {
            debug!(check = %name, "health check registered");
        }
    }

    /// Removes a check.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotFound`] when no such check is registered.
    pub fn unregister(&self, name: &str) -> TelemetryResult<()> {
        recover(self.checks.write())
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TelemetryError::not_found("health check", name))
    }

    /// Names of all registered checks, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        recover(self.checks.read()).keys().cloned().collect()
    }

    /// Runs one check.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::NotFound`] when no such check is registered.
    /// Probe failures and timeouts are reported in the result, not as errors.
    pub async fn run(&self, name: &str) -> TelemetryResult<HealthCheckResult> {
        let check = recover(self.checks.read())
            .get(name)
            .map(|entry| entry.check.clone())
            .ok_or_else(|| TelemetryError::not_found("health check", name))?;
        let result = check.execute().await;
        self.store(&check, &result);
        Ok(result)
    }

    /// Runs every check concurrently and aggregates the outcome.
    pub async fn run_all(&self) -> HealthReport {
        let checks: Vec<HealthCheck> = recover(self.checks.read())
            .values()
            .map(|entry| entry.check.clone())
            .collect();

        let results = join_all(checks.iter().map(|check| check.execute())).await;

        let mut report = BTreeMap::new();
        for (check, result) in checks.iter().zip(results) {
            self.store(check, &result);
            report.insert(check.name.clone(), result);
        }

        let status = if report.values().all(HealthCheckResult::is_healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            checks: report,
            timestamp: Utc::now(),
        }
    }

    /// Reports last results without running any probe.
    #[must_use]
    pub fn get_status(&self) -> HealthOverview {
        let checks = recover(self.checks.read())
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    CheckStatus {
                        timeout: entry.check.timeout,
                        last_result: entry.last_result.clone(),
                    },
                )
            })
            .collect();
        HealthOverview {
            checks,
            timestamp: Utc::now(),
        }
    }

    fn store(&self, check: &HealthCheck, result: &HealthCheckResult) {
        let mut checks = recover(self.checks.write());
        // Skip if the check was unregistered or replaced while running.
        if let Some(entry) = checks.get_mut(&check.name) {
            if Arc::ptr_eq(&entry.check.probe, &check.probe) {
                entry.last_result = Some(result.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn panicking_probe() -> anyhow::Result<bool> {
        panic!("probe bug")
    }

    fn healthy() -> HealthCheck {
        HealthCheck::new("db", Duration::from_secs(1), || async { anyhow::Ok(true) }).unwrap()
    }

    #[tokio::test]
    async fn healthy_probe() {
        let checker = HealthChecker::new();
        checker.register(healthy());
        let result = checker.run("db").await.unwrap();
        assert!(result.is_healthy());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn failing_and_erroring_probes() {
        let checker = HealthChecker::new();
        checker.register(
            HealthCheck::new("down", Duration::from_secs(1), || async { anyhow::Ok(false) }).unwrap(),
        );
        checker.register(
            HealthCheck::new("broken", Duration::from_secs(1), || async {
                Err(anyhow!("connection refused"))
            })
            .unwrap(),
        );

        let down = checker.run("down").await.unwrap();
        assert_eq!(down.status, HealthStatus::Unhealthy);
        assert!(down.error.is_none());

        let broken = checker.run("broken").await.unwrap();
        assert_eq!(broken.status, HealthStatus::Unhealthy);
        assert_eq!(broken.error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn slow_probe_times_out() {
        let checker = HealthChecker::new();
        checker.register(
            HealthCheck::new("slow", Duration::from_millis(50), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                anyhow::Ok(true)
            })
            .unwrap(),
        );

        let started = Instant::now();
        let result = checker.run("slow").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn blocking_probe_times_out_without_blocking_caller() {
        let checker = HealthChecker::new();
        checker.register(
            HealthCheck::blocking("legacy", Duration::from_millis(50), || {
                std::thread::sleep(Duration::from_millis(500));
                anyhow::Ok(true)
            })
            .unwrap(),
        );

        let started = Instant::now();
        let result = checker.run("legacy").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(result.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn panicking_probe_is_unhealthy() {
        let checker = HealthChecker::new();
        checker.register(
            HealthCheck::new("panics", Duration::from_secs(1), panicking_probe).unwrap(),
        );
        let result = checker.run("panics").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("probe panicked"));
    }

    #[tokio::test]
    async fn run_all_is_parallel() {
        let checker = HealthChecker::new();
        for name in ["a", "b", "c"] {
            checker.register(
                HealthCheck::new(name, Duration::from_millis(100), || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    anyhow::Ok(true)
                })
                .unwrap(),
            );
        }
        checker.register(healthy());

        let started = Instant::now();
        let report = checker.run_all().await;
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks.len(), 4);
        assert!(report.checks["db"].is_healthy());
        assert!(!report.checks["a"].is_healthy());
    }

    #[tokio::test]
    async fn run_all_healthy_when_all_pass() {
        let checker = HealthChecker::new();
        checker.register(healthy());
        let report = checker.run_all().await;
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn status_reflects_last_run() {
        let checker = HealthChecker::new();
        checker.register(healthy());
        assert!(checker.get_status().checks["db"].last_result.is_none());

        checker.run_all().await;
        let status = checker.get_status();
        assert!(status.checks["db"].last_result.as_ref().unwrap().is_healthy());
    }

    #[tokio::test]
    async fn unknown_check_errors() {
        let checker = HealthChecker::new();
        assert!(matches!(
            checker.run("missing").await,
            Err(TelemetryError::NotFound { .. })
        ));
        assert!(checker.unregister("missing").is_err());

        checker.register(healthy());
        checker.unregister("db").unwrap();
        assert!(checker.names().is_empty());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = HealthCheck::new("db", Duration::ZERO, || async { anyhow::Ok(true) })
            .expect_err("zero timeout");
        assert!(matches!(err, TelemetryError::InvalidArgument { .. }));
    }
}
