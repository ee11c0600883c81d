//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `FAKECDN_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `FAKECDN_` override YAML values
//! 3. **CDN_API_ENDPOINT / CDN_API_VIP** - Special cases: override `push.endpoint` and the `vip`
//!    push header
//! 4. **CLI flags** - `--dry-run` and `--seed` win over everything else
//!
//! `FAKECDN_CONFIG` and `FAKECDN_OUTPUT_DIR` are read by the CLI parser, not merged into `Config`.
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `FAKECDN_TARGET__BANDWIDTH_GBPS=20` sets the `target.bandwidth_gbps` field.
//!
//! ## Configuration Structure
//!
//! - **Target**: `target.bandwidth_gbps`, `target.percentile`, `target.tolerance` - the billing
//!   value the generated curve is calibrated onto and the validator's pass threshold
//! - **Time**: `time.start_date`, `time.duration_days`, `time.interval`, `time.basis`
//! - **Pattern**: daily/weekly/monthly shape, noise and bursts
//! - **Realism**: cache hit, object size, origin failure ranges and the status baseline
//! - **Anomalies**: per-kind trigger probabilities, durations and the maintenance window
//! - **Dimensions**: tenant, regions and domains with their weights
//! - **Push**: endpoint, headers, timeout, retry/backoff, concurrency, rate limit, dry-run
//! - **Storage**: SQLite database URL
//! - **Billing**: unit prices for the billing comparison report
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Calibrate onto 20 Gbps
//! FAKECDN_TARGET__BANDWIDTH_GBPS=20
//!
//! # Push for real
//! FAKECDN_PUSH__DRY_RUN=false
//! CDN_API_ENDPOINT="https://collector.example.com/v1/logs"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use rand::prelude::RngExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::Error;
use crate::types::{StatusDistribution, TimeWindow};

/// Which pipeline the binary drives.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Generate the whole configured window in one pass
    Simulation,
    /// Emit one interval per wall-clock interval boundary
    Realtime,
    /// Backfill a historical `[start, end)` range with throttled pushes
    Catchup,
    /// Recompute percentiles from stored records
    Validate,
}

/// CLI args - config file plus run mode selection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "FAKECDN_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without generating anything
    #[arg(long)]
    pub validate: bool,

    /// Run mode
    #[arg(long, value_enum, default_value_t = Mode::Simulation)]
    pub mode: Mode,

    /// Realtime mode: emit a single interval and exit
    #[arg(long)]
    pub once: bool,

    /// Catchup/validate range start (inclusive), e.g. 2025-01-01
    #[arg(long)]
    pub start: Option<NaiveDate>,

    /// Catchup/validate range end (exclusive), e.g. 2025-01-02
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Generate everything but never touch the network
    #[arg(long)]
    pub dry_run: bool,

    /// Seed for the random generator (reproducible runs)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Write logs.jsonl, stats.json and bandwidth_curve.json here after a simulation or catchup
    #[arg(short = 'o', long, env = "FAKECDN_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Validate mode: read records from this JSON-lines file instead of the store
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Args pointing at a config file with every flag left at its default.
    pub fn with_config(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            validate: false,
            mode: Mode::Simulation,
            once: false,
            start: None,
            end: None,
            dry_run: false,
            seed: None,
            output_dir: None,
            log_file: None,
        }
    }
}

/// Main application configuration.
///
/// This is the root configuration structure loaded from YAML and environment variables.
/// All fields have sensible defaults defined in the `Default` implementations.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Billing target the curve is calibrated onto
    pub target: TargetConfig,
    /// Generation window and interval grid
    pub time: TimeConfig,
    /// Shape of the raw bandwidth curve
    pub pattern: PatternConfig,
    /// Ranges used when deriving per-record metrics
    pub realism: RealismConfig,
    /// Anomaly injection settings
    pub anomalies: AnomalyConfig,
    /// Tenant, regions and domains
    pub dimensions: DimensionsConfig,
    /// Push transport settings
    pub push: PushConfig,
    /// Record storage settings
    pub storage: StorageConfig,
    /// Prices for the billing comparison report
    pub billing: BillingConfig,
    /// Seed for the random generator; a random seed is drawn when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    /// Target 95th-percentile bandwidth in Gbps
    pub bandwidth_gbps: f64,
    /// Percentile the curve is calibrated onto
    pub percentile: f64,
    /// Maximum relative deviation accepted by the validator
    pub tolerance: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            bandwidth_gbps: 15.0,
            percentile: 95.0,
            tolerance: 0.01,
        }
    }
}

impl TargetConfig {
    /// Target in bits per second (decimal units: 1 Gbps = 1e9 bps).
    pub fn bandwidth_bps(&self) -> f64 {
        self.bandwidth_gbps * 1e9
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeConfig {
    /// First day of the generated window (midnight UTC)
    pub start_date: NaiveDate,
    /// Window length in days
    pub duration_days: u32,
    /// Interval between samples
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Clock used for time-of-day and day-of-week keyed patterns
    pub basis: TimeBasis,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default(),
            duration_days: 30,
            interval: Duration::from_secs(300),
            basis: TimeBasis::Utc,
        }
    }
}

impl TimeConfig {
    pub fn start(&self) -> DateTime<Utc> {
        date_start(self.start_date)
    }

    /// The configured generation window.
    pub fn window(&self) -> Result<TimeWindow, Error> {
        TimeWindow::from_days(self.start(), self.duration_days, self.interval)
    }
}

/// Midnight UTC of `date`.
pub fn date_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// Explicit clock for pattern keying, never inferred from the host.
///
/// Serialized as `utc` or a fixed offset such as `+08:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeBasis {
    #[default]
    Utc,
    Offset(FixedOffset),
}

impl TimeBasis {
    pub fn offset(&self) -> FixedOffset {
        match self {
            TimeBasis::Utc => Utc.fix(),
            TimeBasis::Offset(offset) => *offset,
        }
    }

    pub fn localize(&self, ts: DateTime<Utc>) -> DateTime<FixedOffset> {
        ts.with_timezone(&self.offset())
    }
}

impl FromStr for TimeBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(TimeBasis::Utc);
        }
        s.parse::<FixedOffset>()
            .map(TimeBasis::Offset)
            .map_err(|e| format!("invalid time basis '{s}' (expected 'utc' or an offset like '+08:00'): {e}"))
    }
}

impl TryFrom<String> for TimeBasis {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for TimeBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBasis::Utc => write!(f, "utc"),
            TimeBasis::Offset(offset) => write!(f, "{offset}"),
        }
    }
}

impl From<TimeBasis> for String {
    fn from(value: TimeBasis) -> Self {
        value.to_string()
    }
}

/// Closed `[min, max]` range, written as a two element list in YAML.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ValueRange(pub f64, pub f64);

impl ValueRange {
    pub fn min(&self) -> f64 {
        self.0
    }

    pub fn max(&self) -> f64 {
        self.1
    }

    pub fn is_ordered(&self) -> bool {
        self.0.is_finite() && self.1.is_finite() && self.0 <= self.1
    }

    pub fn within(&self, lo: f64, hi: f64) -> bool {
        self.is_ordered() && self.0 >= lo && self.1 <= hi
    }

    /// Point at fraction `t` of the way from min to max.
    pub fn lerp(&self, t: f64) -> f64 {
        self.0 + (self.1 - self.0) * t
    }

    pub fn sample(&self, rng: &mut StdRng) -> f64 {
        if self.0 >= self.1 {
            return self.0;
        }
        rng.random_range(self.0..=self.1)
    }
}

/// Inclusive range of interval counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct IntervalRange(pub u32, pub u32);

impl IntervalRange {
    pub fn is_valid(&self) -> bool {
        self.0 >= 1 && self.0 <= self.1
    }

    pub fn sample(&self, rng: &mut StdRng) -> u32 {
        if self.0 >= self.1 {
            return self.0;
        }
        rng.random_range(self.0..=self.1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatternConfig {
    /// Time-of-day shape
    pub daily: DailyPattern,
    /// Day-of-week multipliers, Monday first
    pub weekly: Vec<f64>,
    /// Multiplier applied to the first and last `month_edge_days` of the window
    pub month_edge_factor: f64,
    pub month_edge_days: u32,
    /// Uniform noise amplitude, e.g. 0.08 for ±8%
    pub noise_amplitude: f64,
    pub burst: BurstConfig,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            daily: DailyPattern::default(),
            weekly: vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.85, 0.85],
            month_edge_factor: 1.15,
            month_edge_days: 3,
            noise_amplitude: 0.08,
            burst: BurstConfig::default(),
        }
    }
}

/// Time-of-day multiplier.
///
/// Without `hourly`, a cosine between `low` and `high` peaking at `peak_hour`. With `hourly`
/// (24 entries, index = hour), values are interpolated linearly between hours.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DailyPattern {
    pub low: f64,
    pub high: f64,
    pub peak_hour: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hourly: Option<Vec<f64>>,
}

impl Default for DailyPattern {
    fn default() -> Self {
        Self {
            low: 0.6,
            high: 1.3,
            peak_hour: 20.0,
            hourly: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BurstConfig {
    /// Per-interval probability of starting a burst
    pub probability: f64,
    /// Peak multiplier range relative to the shaped value
    pub multiplier: ValueRange,
    /// Burst length in intervals
    pub duration_intervals: IntervalRange,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            probability: 0.03,
            multiplier: ValueRange(2.0, 3.0),
            duration_intervals: IntervalRange(1, 2),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealismConfig {
    pub cache_hit_rate: ValueRange,
    pub avg_object_size_kb: ValueRange,
    pub origin_fail_rate: ValueRange,
    /// Status class fractions before jitter and anomaly effects
    pub status_baseline: StatusDistribution,
    /// Multiplicative jitter applied to each status class, e.g. 0.1 for ±10%
    pub status_jitter: f64,
}

impl Default for RealismConfig {
    fn default() -> Self {
        Self {
            cache_hit_rate: ValueRange(0.85, 0.95),
            avg_object_size_kb: ValueRange(200.0, 2048.0),
            origin_fail_rate: ValueRange(0.001, 0.01),
            status_baseline: StatusDistribution::default(),
            status_jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnomalyConfig {
    pub enabled: bool,
    pub origin_failure: AnomalyKindConfig,
    pub cache_purge: AnomalyKindConfig,
    pub ddos: AnomalyKindConfig,
    pub maintenance: AnomalyKindConfig,
    /// Local hours `[start, end)` in which maintenance may start
    pub maintenance_hours: HourWindow,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origin_failure: AnomalyKindConfig::new(0.001, IntervalRange(1, 6)),
            cache_purge: AnomalyKindConfig::new(0.01, IntervalRange(1, 3)),
            ddos: AnomalyKindConfig::new(0.005, IntervalRange(2, 12)),
            maintenance: AnomalyKindConfig::new(0.05, IntervalRange(3, 12)),
            maintenance_hours: HourWindow { start: 2, end: 5 },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnomalyKindConfig {
    /// Per-interval trigger probability on each scope
    pub probability: f64,
    pub duration_intervals: IntervalRange,
    /// Magnitude range, within [0, 1]
    pub magnitude: ValueRange,
}

impl AnomalyKindConfig {
    pub fn new(probability: f64, duration_intervals: IntervalRange) -> Self {
        Self {
            probability,
            duration_intervals,
            magnitude: ValueRange(0.0, 1.0),
        }
    }
}

impl Default for AnomalyKindConfig {
    fn default() -> Self {
        Self::new(0.0, IntervalRange(1, 1))
    }
}

/// Hours of the local day, `[start, end)`. Wraps past midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DimensionsConfig {
    pub tenant_id: String,
    /// Relative per-interval perturbation of region weights, e.g. 0.1 for ±10%
    pub region_jitter: f64,
    pub regions: Vec<RegionConfig>,
    pub domains: Vec<DomainConfig>,
}

impl Default for DimensionsConfig {
    fn default() -> Self {
        let region = |region: &str, country: &str, weight: f64| RegionConfig {
            region: region.to_string(),
            country: country.to_string(),
            weight,
        };
        let domain = |name: &str| DomainConfig {
            name: name.to_string(),
            weight: 1.0,
        };
        Self {
            tenant_id: "tenant-001".to_string(),
            region_jitter: 0.1,
            regions: vec![
                region("us-east", "US", 0.30),
                region("eu-west", "DE", 0.25),
                region("ap-southeast", "SG", 0.20),
                region("ap-northeast", "JP", 0.15),
                region("sa-east", "BR", 0.10),
            ],
            domains: vec![domain("static.example.com"), domain("video.example.com"), domain("api.example.com")],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    pub region: String,
    pub country: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default = "default_domain_weight")]
    pub weight: f64,
}

fn default_domain_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushConfig {
    /// Collector endpoint; required unless `dry_run` is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
    /// Extra headers sent with every push
    pub headers: HashMap<String, String>,
    /// Timeout for each individual push attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base backoff in milliseconds, multiplied by `backoff_factor` per retry
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
    /// Worker pool size for concurrent pushes
    pub max_concurrent_pushes: usize,
    /// Catchup push throttle in records per second (0 = unlimited)
    pub rate_limit_per_sec: u32,
    /// Skip network transport entirely
    pub dry_run: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
            max_concurrent_pushes: 4,
            rate_limit_per_sec: 100,
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Persist generated records
    pub enabled: bool,
    /// SQLite connection URL
    pub url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "sqlite://output/cdn_logs.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BillingConfig {
    /// Monthly price per Gbps of 95th-percentile bandwidth
    pub unit_price_per_gbps: f64,
    /// Price per GB for the traffic-billing comparison
    pub traffic_price_per_gb: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            unit_price_per_gbps: 100.0,
            traffic_price_per_gb: 0.8,
        }
    }
}

impl Config {
    /// Load configuration from file, environment and CLI flags, then validate it.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if args.dry_run {
            config.push.dry_run = true;
        }
        if let Some(seed) = args.seed {
            config.seed = Some(seed);
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("FAKECDN_").ignore(&["config", "output_dir"]).split("__"))
            // Collector endpoint and vip header keep their historical variable names
            .merge(Env::raw().only(&["CDN_API_ENDPOINT"]).map(|_| "push.endpoint".into()))
            .merge(Env::raw().only(&["CDN_API_VIP"]).map(|_| "push.headers.vip".into()))
    }

    /// Reject configurations that cannot produce a valid run. Nothing is generated before this passes.
    pub fn validate(&self) -> Result<(), Error> {
        let target = &self.target;
        if !(target.bandwidth_gbps.is_finite() && target.bandwidth_gbps > 0.0) {
            return Err(Error::config(format!(
                "target bandwidth must be positive, got {} Gbps",
                target.bandwidth_gbps
            )));
        }
        if !(target.percentile > 0.0 && target.percentile <= 100.0) {
            return Err(Error::config(format!("target percentile must be in (0, 100], got {}", target.percentile)));
        }
        if !(target.tolerance > 0.0 && target.tolerance < 1.0) {
            return Err(Error::config(format!("tolerance must be in (0, 1), got {}", target.tolerance)));
        }

        if self.time.interval.as_millis() == 0 {
            return Err(Error::config("time.interval must be positive"));
        }
        if self.time.duration_days == 0 {
            return Err(Error::config("time.duration_days must be at least 1"));
        }

        self.validate_pattern()?;
        self.validate_realism()?;
        self.validate_anomalies()?;
        self.validate_dimensions()?;

        let push = &self.push;
        if push.max_concurrent_pushes == 0 {
            return Err(Error::config("push.max_concurrent_pushes must be at least 1"));
        }
        if push.backoff_factor == 0 {
            return Err(Error::config("push.backoff_factor must be at least 1"));
        }
        if push.timeout.is_zero() {
            return Err(Error::config("push.timeout must be positive"));
        }
        if !push.dry_run && push.endpoint.is_none() {
            return Err(Error::config(
                "push.endpoint is required unless push.dry_run is set (or set CDN_API_ENDPOINT)",
            ));
        }

        Ok(())
    }

    fn validate_pattern(&self) -> Result<(), Error> {
        let pattern = &self.pattern;
        let daily = &pattern.daily;
        if !(daily.low >= 0.0 && daily.low <= daily.high) {
            return Err(Error::config(format!(
                "pattern.daily requires 0 <= low <= high, got low={} high={}",
                daily.low, daily.high
            )));
        }
        if !(0.0..24.0).contains(&daily.peak_hour) {
            return Err(Error::config(format!("pattern.daily.peak_hour must be in [0, 24), got {}", daily.peak_hour)));
        }
        if let Some(hourly) = &daily.hourly {
            if hourly.len() != 24 {
                return Err(Error::config(format!("pattern.daily.hourly needs 24 entries, got {}", hourly.len())));
            }
            if hourly.iter().any(|m| !(m.is_finite() && *m >= 0.0)) {
                return Err(Error::config("pattern.daily.hourly entries must be non-negative"));
            }
        }
        if pattern.weekly.len() != 7 {
            return Err(Error::config(format!("pattern.weekly needs 7 entries, got {}", pattern.weekly.len())));
        }
        if pattern.weekly.iter().any(|m| !(m.is_finite() && *m >= 0.0)) {
            return Err(Error::config("pattern.weekly entries must be non-negative"));
        }
        if !(pattern.month_edge_factor.is_finite() && pattern.month_edge_factor > 0.0) {
            return Err(Error::config("pattern.month_edge_factor must be positive"));
        }
        if !(0.0..1.0).contains(&pattern.noise_amplitude) {
            return Err(Error::config(format!(
                "pattern.noise_amplitude must be in [0, 1), got {}",
                pattern.noise_amplitude
            )));
        }
        let burst = &pattern.burst;
        check_probability("pattern.burst.probability", burst.probability)?;
        if !(burst.multiplier.is_ordered() && burst.multiplier.min() >= 1.0) {
            return Err(Error::config("pattern.burst.multiplier must be an ordered range starting at >= 1"));
        }
        if !burst.duration_intervals.is_valid() {
            return Err(Error::config("pattern.burst.duration_intervals must be an ordered range starting at >= 1"));
        }
        Ok(())
    }

    fn validate_realism(&self) -> Result<(), Error> {
        let realism = &self.realism;
        if !realism.cache_hit_rate.within(0.0, 1.0) {
            return Err(Error::config("realism.cache_hit_rate must be an ordered range within [0, 1]"));
        }
        if !(realism.avg_object_size_kb.is_ordered() && realism.avg_object_size_kb.min() > 0.0) {
            return Err(Error::config("realism.avg_object_size_kb must be an ordered range of positive sizes"));
        }
        if !realism.origin_fail_rate.within(0.0, 1.0) {
            return Err(Error::config("realism.origin_fail_rate must be an ordered range within [0, 1]"));
        }
        let baseline = realism.status_baseline.as_array();
        if baseline.iter().any(|f| !(f.is_finite() && *f >= 0.0)) || baseline.iter().sum::<f64>() <= 0.0 {
            return Err(Error::config("realism.status_baseline must be non-negative with a positive sum"));
        }
        if !(0.0..1.0).contains(&realism.status_jitter) {
            return Err(Error::config("realism.status_jitter must be in [0, 1)"));
        }
        Ok(())
    }

    fn validate_anomalies(&self) -> Result<(), Error> {
        let anomalies = &self.anomalies;
        for (name, kind) in [
            ("origin_failure", &anomalies.origin_failure),
            ("cache_purge", &anomalies.cache_purge),
            ("ddos", &anomalies.ddos),
            ("maintenance", &anomalies.maintenance),
        ] {
            check_probability(&format!("anomalies.{name}.probability"), kind.probability)?;
            if !kind.duration_intervals.is_valid() {
                return Err(Error::config(format!(
                    "anomalies.{name}.duration_intervals must be an ordered range starting at >= 1"
                )));
            }
            if !kind.magnitude.within(0.0, 1.0) {
                return Err(Error::config(format!("anomalies.{name}.magnitude must be within [0, 1]")));
            }
        }
        let hours = anomalies.maintenance_hours;
        if hours.start >= 24 || hours.end > 24 {
            return Err(Error::config("anomalies.maintenance_hours must be within 0..24"));
        }
        Ok(())
    }

    fn validate_dimensions(&self) -> Result<(), Error> {
        let dims = &self.dimensions;
        if dims.regions.is_empty() {
            return Err(Error::config("dimensions.regions must not be empty"));
        }
        if dims.domains.is_empty() {
            return Err(Error::config("dimensions.domains must not be empty"));
        }
        if dims.regions.iter().any(|r| !(r.weight.is_finite() && r.weight >= 0.0)) {
            return Err(Error::config("dimensions.regions weights must be non-negative"));
        }
        if dims.regions.iter().map(|r| r.weight).sum::<f64>() <= 0.0 {
            return Err(Error::config("dimensions.regions weights must sum to a positive value"));
        }
        if dims.domains.iter().any(|d| !(d.weight.is_finite() && d.weight >= 0.0)) {
            return Err(Error::config("dimensions.domains weights must be non-negative"));
        }
        if dims.domains.iter().map(|d| d.weight).sum::<f64>() <= 0.0 {
            return Err(Error::config("dimensions.domains weights must sum to a positive value"));
        }
        if !(0.0..1.0).contains(&dims.region_jitter) {
            return Err(Error::config("dimensions.region_jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

fn check_probability(name: &str, p: f64) -> Result<(), Error> {
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::config(format!("{name} must be a probability in [0, 1], got {p}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.time.window().unwrap().len(), 8640);
        assert_eq!(config.target.bandwidth_bps(), 15e9);
    }

    #[test]
    fn test_yaml_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
seed: 42
target:
  bandwidth_gbps: 20
  tolerance: 0.005
time:
  start_date: 2025-03-01
  duration_days: 2
  interval: 1m
  basis: "+08:00"
realism:
  cache_hit_rate: [0.8, 0.9]
dimensions:
  regions:
    - region: cn-east
      country: CN
      weight: 0.6
    - region: cn-north
      country: CN
      weight: 0.4
  domains:
    - name: cdn.example.cn
"#,
            )?;

            let config = Config::load(&Args::with_config("test.yaml"))?;

            assert_eq!(config.seed, Some(42));
            assert_eq!(config.target.bandwidth_gbps, 20.0);
            assert_eq!(config.target.percentile, 95.0); // default
            assert_eq!(config.time.interval, Duration::from_secs(60));
            assert_eq!(config.time.window().unwrap().len(), 2 * 1440);
            assert_eq!(config.time.basis.offset().local_minus_utc(), 8 * 3600);
            assert_eq!(config.realism.cache_hit_rate, ValueRange(0.8, 0.9));
            assert_eq!(config.dimensions.regions.len(), 2);
            assert_eq!(config.dimensions.domains[0].weight, 1.0);

            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "target:\n  bandwidth_gbps: 10\n")?;

            jail.set_env("FAKECDN_TARGET__BANDWIDTH_GBPS", "12.5");
            jail.set_env("FAKECDN_PUSH__MAX_RETRIES", "7");
            jail.set_env("FAKECDN_CONFIG", "test.yaml");
            jail.set_env("FAKECDN_OUTPUT_DIR", "output");

            let config = Config::load(&Args::with_config("test.yaml"))?;
            assert_eq!(config.target.bandwidth_gbps, 12.5);
            assert_eq!(config.push.max_retries, 7);

            Ok(())
        });
    }

    #[test]
    fn test_cdn_api_env_vars() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "push:\n  dry_run: false\n")?;

            jail.set_env("CDN_API_ENDPOINT", "https://collector.example.com/v1/logs");
            jail.set_env("CDN_API_VIP", "vip-123");

            let config = Config::load(&Args::with_config("test.yaml"))?;
            assert_eq!(
                config.push.endpoint.as_ref().map(Url::as_str),
                Some("https://collector.example.com/v1/logs")
            );
            assert_eq!(config.push.headers.get("vip").map(String::as_str), Some("vip-123"));

            Ok(())
        });
    }

    #[test]
    fn test_parse_output_and_log_file_flags() {
        let args = Args::try_parse_from(["fakecdn", "--mode", "catchup", "-o", "out", "--start", "2025-01-02"]).unwrap();
        assert_eq!(args.mode, Mode::Catchup);
        assert_eq!(args.output_dir, Some(PathBuf::from("out")));
        assert_eq!(args.start, NaiveDate::from_ymd_opt(2025, 1, 2));

        let args = Args::try_parse_from(["fakecdn", "--mode", "validate", "--log-file", "out/logs.jsonl"]).unwrap();
        assert_eq!(args.mode, Mode::Validate);
        assert_eq!(args.log_file, Some(PathBuf::from("out/logs.jsonl")));
    }

    #[test]
    fn test_cli_flags_win() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "seed: 1\npush:\n  dry_run: false\n  endpoint: http://localhost:9/\n")?;

            let mut args = Args::with_config("test.yaml");
            args.dry_run = true;
            args.seed = Some(99);

            let config = Config::load(&args)?;
            assert!(config.push.dry_run);
            assert_eq!(config.seed, Some(99));

            Ok(())
        });
    }

    #[test]
    fn test_rejects_non_positive_target() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "target:\n  bandwidth_gbps: 0\n")?;
            let err = Config::load(&Args::with_config("test.yaml")).unwrap_err();
            assert!(err.to_string().contains("target bandwidth must be positive"));
            Ok(())
        });
    }

    #[test]
    fn test_rejects_unknown_fields() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "target:\n  bandwidth_mbps: 10\n")?;
            assert!(Config::load(&Args::with_config("test.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validation_rules() {
        let mut config = Config::default();
        config.dimensions.regions.iter_mut().for_each(|r| r.weight = 0.0);
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        let mut config = Config::default();
        config.dimensions.domains.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pattern.weekly = vec![1.0; 6];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pattern.daily.hourly = Some(vec![1.0; 23]);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.realism.cache_hit_rate = ValueRange(0.9, 0.8);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.anomalies.ddos.probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.push.dry_run = false;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.time.interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_time_basis_parsing() {
        assert_eq!("utc".parse::<TimeBasis>().unwrap(), TimeBasis::Utc);
        assert_eq!("UTC".parse::<TimeBasis>().unwrap(), TimeBasis::Utc);
        let basis: TimeBasis = "-05:00".parse().unwrap();
        assert_eq!(basis.offset().local_minus_utc(), -5 * 3600);
        assert_eq!(basis.to_string(), "-05:00");
        assert!("mars/olympus".parse::<TimeBasis>().is_err());
    }

    #[test]
    fn test_hour_window_wraps() {
        let night = HourWindow { start: 22, end: 3 };
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(!night.contains(3));
        assert!(!night.contains(12));

        let early = HourWindow { start: 2, end: 5 };
        assert!(early.contains(2));
        assert!(early.contains(4));
        assert!(!early.contains(5));
    }
}
