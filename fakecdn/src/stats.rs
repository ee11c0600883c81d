//! Percentile statistics shared by curve calibration and validation.
//!
//! Every percentile in this crate uses the **nearest-rank** method: for `n` sorted
//! values and percentile `p`, the result is the value at 1-based rank
//! `ceil(p / 100 * n)` (clamped to `[1, n]`). Calibration and validation must agree
//! on the method, otherwise a curve calibrated onto a target would not validate
//! against it.

use serde::{Deserialize, Serialize};

/// Nearest-rank percentile of an ascending slice. Returns `None` for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    Some(sorted[rank_index(sorted.len(), p)])
}

/// Zero-based index selected by the nearest-rank method.
pub fn rank_index(n: usize, p: f64) -> usize {
    // The epsilon keeps exact products such as 95 * 20 / 100 from rounding up a rank.
    let rank = (p * n as f64 / 100.0 - 1e-9).ceil() as usize;
    rank.clamp(1, n) - 1
}

/// Sort a copy of `values` ascending. NaNs sort last.
pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.sort_by(f64::total_cmp);
    out
}

/// Summary statistics over a bandwidth series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    /// Samples strictly above p95, the "free" peaks under 95th-percentile billing
    pub above_p95: usize,
}

impl Summary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let sorted = sorted(values);
        let p95 = percentile(&sorted, 95.0)?;
        let count = sorted.len();
        Some(Self {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sorted.iter().sum::<f64>() / count as f64,
            p50: percentile(&sorted, 50.0)?,
            p95,
            p99: percentile(&sorted, 99.0)?,
            above_p95: sorted.iter().filter(|v| **v > p95).count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank_small_sets() {
        let values: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(percentile(&values, 95.0), Some(19.0));
        assert_eq!(percentile(&values, 50.0), Some(10.0));
        assert_eq!(percentile(&values, 100.0), Some(20.0));
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&[], 95.0), None);
        assert_eq!(percentile(&[7.0], 95.0), Some(7.0));
    }

    #[test]
    fn test_rank_index_for_month_of_five_minute_samples() {
        // 8640 samples: rank ceil(0.95 * 8640) = 8208
        assert_eq!(rank_index(8640, 95.0), 8207);
        assert_eq!(rank_index(288, 95.0), 273);
    }

    #[test]
    fn test_summary() {
        let values: Vec<f64> = (1..=100).rev().map(f64::from).collect();
        let summary = Summary::from_values(&values).unwrap();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert_eq!(summary.p95, 95.0);
        assert_eq!(summary.p99, 99.0);
        assert_eq!(summary.above_p95, 5);
        assert!((summary.mean - 50.5).abs() < 1e-12);
        assert!(Summary::from_values(&[]).is_none());
    }
}
