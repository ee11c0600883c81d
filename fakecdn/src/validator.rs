//! Read-back validation of generated records against the billing target.
//!
//! Records are summed per timestamp to rebuild the aggregate bandwidth series, and that series
//! goes through the same nearest-rank percentile used for calibration. A deviation above
//! tolerance is reported as a failed verdict, not as an error.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::TargetConfig;
use crate::errors::{Error, Result};
use crate::export::read_records;
use crate::stats::{Summary, percentile, sorted};
use crate::storage::{RecordFilter, Storage};
use crate::types::{LogRecord, TimeRange};

/// Percentile statistics of one aggregate series, in Gbps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub samples: usize,
    pub mean_gbps: f64,
    pub p95_gbps: f64,
    pub max_gbps: f64,
}

impl Breakdown {
    fn from_series(series: &BTreeMap<DateTime<Utc>, f64>) -> Option<Self> {
        let gbps: Vec<f64> = series.values().map(|bps| bps / 1e9).collect();
        let summary = Summary::from_values(&gbps)?;
        Some(Self {
            samples: summary.count,
            mean_gbps: summary.mean,
            p95_gbps: summary.p95,
            max_gbps: summary.max,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub target_gbps: f64,
    pub percentile: f64,
    /// Observed value at the configured percentile
    pub observed_gbps: f64,
    pub mean_gbps: f64,
    pub p50_gbps: f64,
    pub p95_gbps: f64,
    pub p99_gbps: f64,
    pub min_gbps: f64,
    pub max_gbps: f64,
    /// `|observed - target| / target`
    pub deviation: f64,
    pub tolerance: f64,
    pub pass: bool,
    pub sample_count: usize,
    /// Aggregate samples strictly above p95
    pub above_p95: usize,
    pub record_count: usize,
    pub total_traffic_bytes: u64,
    /// Aggregate interval length in seconds, from the records
    pub interval_secs: u64,
    pub by_region: BTreeMap<String, Breakdown>,
    pub by_domain: BTreeMap<String, Breakdown>,
}

/// Sum bandwidth per timestamp.
fn aggregate<'a>(records: impl Iterator<Item = &'a LogRecord>) -> BTreeMap<DateTime<Utc>, f64> {
    let mut series = BTreeMap::new();
    for r in records {
        *series.entry(r.timestamp).or_insert(0.0) += r.bandwidth_bps;
    }
    series
}

fn breakdown_by<F>(records: &[LogRecord], key: F) -> BTreeMap<String, Breakdown>
where
    F: Fn(&LogRecord) -> &str,
{
    let mut groups: BTreeMap<String, Vec<&LogRecord>> = BTreeMap::new();
    for r in records {
        groups.entry(key(r).to_string()).or_default().push(r);
    }
    groups
        .into_iter()
        .filter_map(|(name, group)| Breakdown::from_series(&aggregate(group.into_iter())).map(|b| (name, b)))
        .collect()
}

/// Validate `records` against `target`.
pub fn validate(records: &[LogRecord], target: &TargetConfig) -> Result<ValidationResult> {
    let series = aggregate(records.iter());
    let gbps: Vec<f64> = series.values().map(|bps| bps / 1e9).collect();
    let Some(summary) = Summary::from_values(&gbps) else {
        return Err(Error::Other(anyhow::anyhow!("no records to validate")));
    };
    let observed = percentile(&sorted(&gbps), target.percentile).unwrap_or(summary.p95);

    let deviation = (observed - target.bandwidth_gbps).abs() / target.bandwidth_gbps;
    let pass = deviation <= target.tolerance;

    Ok(ValidationResult {
        target_gbps: target.bandwidth_gbps,
        percentile: target.percentile,
        observed_gbps: observed,
        mean_gbps: summary.mean,
        p50_gbps: summary.p50,
        p95_gbps: summary.p95,
        p99_gbps: summary.p99,
        min_gbps: summary.min,
        max_gbps: summary.max,
        deviation,
        tolerance: target.tolerance,
        pass,
        sample_count: summary.count,
        above_p95: summary.above_p95,
        record_count: records.len(),
        total_traffic_bytes: records.iter().map(|r| r.traffic_bytes).sum(),
        interval_secs: records.first().map(|r| r.interval_secs).unwrap_or_default(),
        by_region: breakdown_by(records, |r| r.region.as_str()),
        by_domain: breakdown_by(records, |r| r.domain.as_str()),
    })
}

/// Read every record in `range` back from `storage` and validate it.
#[instrument(skip(storage, target), fields(start = %range.start, end = %range.end), err)]
pub async fn validate_storage(storage: &dyn Storage, range: TimeRange, target: &TargetConfig) -> Result<ValidationResult> {
    let records = storage.query(range, &RecordFilter::default()).await?;
    let result = validate(&records, target)?;
    log_verdict(&result);
    Ok(result)
}

/// Validate every record of a JSON-lines record file.
#[instrument(skip(target), fields(path = %path.display()), err)]
pub async fn validate_file(path: &Path, target: &TargetConfig) -> Result<ValidationResult> {
    let records = read_records(path).await?;
    let result = validate(&records, target)?;
    log_verdict(&result);
    Ok(result)
}

fn log_verdict(result: &ValidationResult) {
    if result.pass {
        info!(
            observed_gbps = result.observed_gbps,
            target_gbps = result.target_gbps,
            deviation = result.deviation,
            samples = result.sample_count,
            "Validation passed"
        );
    } else {
        warn!(
            observed_gbps = result.observed_gbps,
            target_gbps = result.target_gbps,
            deviation = result.deviation,
            tolerance = result.tolerance,
            "Validation failed"
        );
    }
}
