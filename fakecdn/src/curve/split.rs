//! Distribution of the global curve across regions and domains.

use rand::prelude::RngExt;
use rand::rngs::StdRng;

/// Renormalize non-negative weights to fractions summing to 1.
///
/// Returns an even split when every weight is zero.
pub fn normalize(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().map(|w| w.max(0.0)).sum();
    if total <= 0.0 {
        let even = 1.0 / weights.len().max(1) as f64;
        return vec![even; weights.len()];
    }
    weights.iter().map(|w| w.max(0.0) / total).collect()
}

/// Split `total` by `fractions` so the parts add back up to `total`.
///
/// The final non-empty part absorbs the floating-point remainder.
pub fn split(total: f64, fractions: &[f64]) -> Vec<f64> {
    let mut parts: Vec<f64> = fractions.iter().map(|f| total * f).collect();
    if let Some(last) = fractions.iter().rposition(|f| *f > 0.0) {
        let others: f64 = parts.iter().enumerate().filter(|(i, _)| *i != last).map(|(_, v)| v).sum();
        parts[last] = (total - others).max(0.0);
    }
    parts
}

/// Per-interval regional shares: stationary weights with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct RegionSplitter {
    weights: Vec<f64>,
    jitter: f64,
}

impl RegionSplitter {
    pub fn new(weights: &[f64], jitter: f64) -> Self {
        Self {
            weights: normalize(weights),
            jitter,
        }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Draw one interval's shares. Always sums to 1.
    pub fn shares(&self, rng: &mut StdRng) -> Vec<f64> {
        if self.jitter <= 0.0 {
            return self.weights.clone();
        }
        let jittered: Vec<f64> = self
            .weights
            .iter()
            .map(|w| w * (1.0 + rng.random_range(-self.jitter..=self.jitter)))
            .collect();
        normalize(&jittered)
    }
}
