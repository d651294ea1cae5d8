//! Order statistics shared by histograms and the performance monitor.
//!
//! Quantiles use the nearest-rank rule: for `n` sorted samples the `p`
//! quantile is the value at 1-based rank `ceil(p * n)`. For the samples
//! `1..=10` this yields `p50 = 5`, `p95 = 10`, `p99 = 10`.
//!
//! Every call sorts a copy of the samples. There is no streaming estimator,
//! so the cost grows with retained sample count.

use serde::{Deserialize, Serialize};

/// Descriptive statistics over a non-empty sample set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Number of samples.
    pub count: u64,
    /// Sum of all samples.
    pub sum: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Median (nearest rank).
    pub p50: f64,
    /// 95th percentile (nearest rank).
    pub p95: f64,
    /// 99th percentile (nearest rank).
    pub p99: f64,
}

impl Summary {
    /// Computes statistics over `samples`, returning `None` when empty.
    ///
    /// `NaN` samples are expected to have been rejected by the caller.
    #[must_use]
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let sum: f64 = sorted.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let mean = sum / sorted.len() as f64;

        Some(Self {
            count: sorted.len() as u64,
            sum,
            mean,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: nearest_rank(&sorted, 0.50),
            p95: nearest_rank(&sorted, 0.95),
            p99: nearest_rank(&sorted, 0.99),
        })
    }
}

/// Returns the nearest-rank quantile of an already sorted, non-empty slice.
#[must_use]
pub fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let quantile = quantile.clamp(0.0, 1.0);
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
