//! Bandwidth curve synthesis and exact-percentile calibration.
//!
//! The raw curve for interval `t` is
//!
//! ```text
//! raw(t) = baseline × daily(t) × weekly(t) × monthly(t) × (1 + noise(t)) + burst(t)
//! ```
//!
//! floored at [`MIN_SAMPLE_BPS`]. Calibration then multiplies every sample by
//! `target / raw_p`, where `raw_p` is the nearest-rank percentile of the raw curve. Scaling by a
//! positive constant preserves order, so the calibrated curve's percentile lands on the target up
//! to floating-point rounding, whatever the seed.

pub mod shape;
pub mod split;

use rand::prelude::RngExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{PatternConfig, TimeBasis};
use crate::errors::{Error, Result};
use crate::stats;
use crate::types::{BandwidthSample, TimeWindow};

pub use shape::Shape;
pub use split::RegionSplitter;

/// Floor applied to every raw sample (0.1 Gbps).
pub const MIN_SAMPLE_BPS: f64 = 0.1e9;

/// A curve rescaled onto its target percentile.
#[derive(Debug, Clone)]
pub struct CalibratedCurve {
    pub samples: Vec<BandwidthSample>,
    pub calibration: Calibration,
}

impl CalibratedCurve {
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.bps).collect()
    }
}

/// Outcome of rescaling a raw curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub target_bps: f64,
    pub percentile: f64,
    pub raw_percentile_bps: f64,
    pub scale: f64,
    /// Percentile recomputed from the calibrated samples
    pub achieved_bps: f64,
}

#[derive(Debug, Clone)]
pub struct CurveSynthesizer {
    shape: Shape,
    pattern: PatternConfig,
}

impl CurveSynthesizer {
    pub fn new(pattern: PatternConfig, basis: TimeBasis) -> Self {
        Self {
            shape: Shape::new(pattern.clone(), basis),
            pattern,
        }
    }

    /// Raw shaped curve, one value per interval. `baseline` only sets the absolute level.
    pub fn raw(&self, window: &TimeWindow, baseline: f64, rng: &mut StdRng) -> Vec<f64> {
        let noise = self.pattern.noise_amplitude;
        let burst = &self.pattern.burst;

        let mut values = Vec::with_capacity(window.len());
        // Remaining intervals and multiplier of the running burst.
        let mut burst_left = 0u32;
        let mut burst_multiplier = 1.0;

        for (index, ts) in window.timestamps().enumerate() {
            let jitter = if noise > 0.0 { rng.random_range(-noise..=noise) } else { 0.0 };
            let shaped = baseline * self.shape.factor(window, ts) * (1.0 + jitter);

            if burst_left == 0 && burst.probability > 0.0 && rng.random_bool(burst.probability) {
                burst_multiplier = burst.multiplier.sample(rng);
                burst_left = burst.duration_intervals.sample(rng);
                debug!(index, multiplier = burst_multiplier, intervals = burst_left, "Burst");
            }
            let extra = if burst_left > 0 {
                burst_left -= 1;
                shaped * (burst_multiplier - 1.0)
            } else {
                0.0
            };

            values.push((shaped + extra).max(MIN_SAMPLE_BPS));
        }
        values
    }

    /// Synthesize and calibrate a curve whose `percentile` equals `target_bps`.
    pub fn synthesize(
        &self,
        window: &TimeWindow,
        target_bps: f64,
        percentile: f64,
        rng: &mut StdRng,
    ) -> Result<CalibratedCurve> {
        if !(target_bps.is_finite() && target_bps > 0.0) {
            return Err(Error::config(format!("target bandwidth must be positive, got {target_bps} bps")));
        }
        let raw = self.raw(window, target_bps, rng);
        let (values, calibration) = calibrate(&raw, target_bps, percentile)?;
        let samples = window
            .timestamps()
            .zip(values)
            .map(|(timestamp, bps)| BandwidthSample { timestamp, bps })
            .collect();
        Ok(CalibratedCurve { samples, calibration })
    }
}

/// Scale `raw` so its nearest-rank `percentile` equals `target_bps`.
pub fn calibrate(raw: &[f64], target_bps: f64, percentile: f64) -> Result<(Vec<f64>, Calibration)> {
    if raw.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(Error::calibration("raw curve contains negative or non-finite samples"));
    }
    let sorted = stats::sorted(raw);
    let raw_p = stats::percentile(&sorted, percentile).ok_or_else(|| Error::calibration("raw curve is empty"))?;
    if raw_p <= 0.0 {
        return Err(Error::calibration(format!(
            "raw p{percentile} is zero, the curve cannot be scaled onto {target_bps} bps"
        )));
    }

    let scale = target_bps / raw_p;
    let values: Vec<f64> = raw.iter().map(|v| v * scale).collect();
    let achieved = stats::percentile(&stats::sorted(&values), percentile).unwrap_or_default();

    Ok((
        values,
        Calibration {
            target_bps,
            percentile,
            raw_percentile_bps: raw_p,
            scale,
            achieved_bps: achieved,
        },
    ))
}
