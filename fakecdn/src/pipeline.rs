//! One generation window, end to end: curve → anomalies → derived records.
//!
//! Everything random about a window is drawn up front from a single seeded [`StdRng`]: the raw
//! curve, the per-interval regional shares and the anomaly plan. Record derivation for interval
//! `i` then uses its own generator seeded from the window seed and `i`, so any interval can be
//! (re)generated on its own and still match a full pass.

use chrono::{DateTime, TimeDelta, Utc};
use rand::SeedableRng;
use rand::prelude::RngExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anomaly::{AnomalyInjector, AnomalyKind, AnomalyPlan};
use crate::config::{Config, DimensionsConfig};
use crate::curve::split::{normalize, split};
use crate::curve::{Calibration, CurveSynthesizer, RegionSplitter};
use crate::derive::{MetricDeriver, RecordScope};
use crate::errors::{Error, Result};
use crate::stats::Summary;
use crate::types::{BandwidthSample, LogRecord, TimeWindow};

/// Mixes a window or interval index into a seed.
const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Consecutive generation windows tiled from the configured start date.
///
/// Period 0 is the configured window; real-time runs that leave it continue into
/// period 1, 2, ... (or -1 before the start), each calibrated on its own.
#[derive(Debug, Clone, Copy)]
pub struct Periods {
    origin: DateTime<Utc>,
    length: TimeDelta,
    window: TimeWindow,
    seed: u64,
}

impl Periods {
    pub fn new(config: &Config, seed: u64) -> Result<Self> {
        let window = config.time.window()?;
        Ok(Self {
            origin: window.start(),
            length: window.end() - window.start(),
            window,
            seed,
        })
    }

    pub fn interval(&self) -> std::time::Duration {
        self.window.interval()
    }

    /// Index of the period containing `ts`.
    pub fn period_of(&self, ts: DateTime<Utc>) -> i64 {
        let length_ms = self.length.num_milliseconds();
        (ts - self.origin).num_milliseconds().div_euclid(length_ms)
    }

    pub fn window(&self, period: i64) -> TimeWindow {
        let start = self.origin + TimeDelta::milliseconds(self.length.num_milliseconds() * period);
        TimeWindow::new(start, self.window.interval(), self.window.len()).unwrap_or(self.window)
    }

    /// Seed for a period's generator; period 0 uses the run seed as is.
    pub fn seed(&self, period: i64) -> u64 {
        self.seed ^ (period as u64).wrapping_mul(SEED_MIX)
    }

    /// Align `ts` down onto the interval grid anchored at the configured start.
    pub fn align_down(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.window.align_down(ts)
    }
}

/// Summary of a generated window, logged after synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationStats {
    pub intervals: usize,
    pub bandwidth_gbps: Summary,
    pub total_traffic_tb: f64,
    pub calibration: Calibration,
    pub anomalies: Vec<(AnomalyKind, usize)>,
}

#[derive(Debug, Clone)]
struct Region {
    name: String,
    country: String,
}

/// All state needed to emit any interval of one window.
#[derive(Debug, Clone)]
pub struct Generator {
    window: TimeWindow,
    samples: Vec<BandwidthSample>,
    calibration: Calibration,
    /// Per interval, per region fraction of the global sample
    shares: Vec<Vec<f64>>,
    plan: AnomalyPlan,
    regions: Vec<Region>,
    domains: Vec<String>,
    domain_fractions: Vec<f64>,
    deriver: MetricDeriver,
    derive_seed: u64,
}

impl Generator {
    pub fn new(config: &Config, window: TimeWindow, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dims: &DimensionsConfig = &config.dimensions;
        if dims.regions.is_empty() || dims.domains.is_empty() {
            return Err(Error::config("at least one region and one domain are required"));
        }

        let synthesizer = CurveSynthesizer::new(config.pattern.clone(), config.time.basis);
        let curve = synthesizer.synthesize(
            &window,
            config.target.bandwidth_bps(),
            config.target.percentile,
            &mut rng,
        )?;

        let weights: Vec<f64> = dims.regions.iter().map(|r| r.weight).collect();
        let splitter = RegionSplitter::new(&weights, dims.region_jitter);
        let shares = (0..window.len()).map(|_| splitter.shares(&mut rng)).collect();

        let injector = AnomalyInjector::new(config.anomalies.clone(), config.time.basis);
        let plan = injector.plan(&window, dims.regions.len(), &mut rng);

        let derive_seed = rng.random::<u64>();

        Ok(Self {
            window,
            samples: curve.samples,
            calibration: curve.calibration,
            shares,
            plan,
            regions: dims
                .regions
                .iter()
                .map(|r| Region {
                    name: r.region.clone(),
                    country: r.country.clone(),
                })
                .collect(),
            domains: dims.domains.iter().map(|d| d.name.clone()).collect(),
            domain_fractions: normalize(&dims.domains.iter().map(|d| d.weight).collect::<Vec<_>>()),
            deriver: MetricDeriver::new(
                config.realism.clone(),
                dims.tenant_id.clone(),
                window.interval().as_secs(),
            ),
            derive_seed,
        })
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn samples(&self) -> &[BandwidthSample] {
        &self.samples
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn plan(&self) -> &AnomalyPlan {
        &self.plan
    }

    /// Bandwidth per region at interval `index`; sums to the global sample.
    pub fn region_bandwidth(&self, index: usize) -> Vec<f64> {
        split(self.samples[index].bps, &self.shares[index])
    }

    /// Records for interval `index`, one per (domain, region).
    pub fn records_at(&self, index: usize) -> Vec<LogRecord> {
        if index >= self.samples.len() {
            return Vec::new();
        }
        let mut rng = StdRng::seed_from_u64(self.derive_seed ^ (index as u64).wrapping_mul(SEED_MIX));
        let timestamp = self.samples[index].timestamp;

        let mut records = Vec::with_capacity(self.regions.len() * self.domains.len());
        for (scope, (region, region_bps)) in self.regions.iter().zip(self.region_bandwidth(index)).enumerate() {
            let effects = self.plan.effects_at(scope, index);
            for (domain, domain_bps) in self.domains.iter().zip(split(region_bps, &self.domain_fractions)) {
                let at = RecordScope {
                    timestamp,
                    domain,
                    region: &region.name,
                    country: &region.country,
                };
                records.push(self.deriver.derive(at, domain_bps, &effects, &mut rng));
            }
        }
        records
    }

    /// Records for the whole window, in interval order.
    pub fn records(&self) -> impl Iterator<Item = LogRecord> + '_ {
        (0..self.samples.len()).flat_map(|index| self.records_at(index))
    }

    pub fn stats(&self) -> GenerationStats {
        let gbps: Vec<f64> = self.samples.iter().map(|s| s.bps / 1e9).collect();
        let interval_secs = self.window.interval_secs();
        let total_bytes: f64 = self.samples.iter().map(|s| s.bps * interval_secs / 8.0).sum();
        GenerationStats {
            intervals: self.samples.len(),
            bandwidth_gbps: Summary::from_values(&gbps).unwrap_or_default(),
            total_traffic_tb: total_bytes / 1e12,
            calibration: self.calibration,
            anomalies: AnomalyKind::ALL.iter().map(|k| (*k, self.plan.count(*k))).collect(),
        }
    }

    /// Log the generation summary.
    pub fn log_stats(&self) {
        let stats = self.stats();
        let bw = stats.bandwidth_gbps;
        info!(
            start = %self.window.start(),
            intervals = stats.intervals,
            p50_gbps = bw.p50,
            p95_gbps = bw.p95,
            p99_gbps = bw.p99,
            min_gbps = bw.min,
            max_gbps = bw.max,
            mean_gbps = bw.mean,
            total_traffic_tb = stats.total_traffic_tb,
            scale = stats.calibration.scale,
            anomalies = self.plan.len(),
            "Generated bandwidth curve"
        );
    }
}
