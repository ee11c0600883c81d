//! Core value types shared across the generation pipeline.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::anomaly::AnomalyKind;
use crate::errors::{Error, Result};

/// A fixed grid of `count` intervals starting at `start`.
///
/// The interval is always positive and the window always holds at least one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    interval: Duration,
    count: usize,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, interval: Duration, count: usize) -> Result<Self> {
        if interval.as_millis() == 0 {
            return Err(Error::config("interval duration must be positive"));
        }
        if count == 0 {
            return Err(Error::config("time window must contain at least one interval"));
        }
        Ok(Self { start, interval, count })
    }

    /// Window covering the half-open range `[start, end)`.
    ///
    /// The count is `ceil((end - start) / interval)`, so a range shorter than one
    /// interval still yields a single interval.
    pub fn covering(start: DateTime<Utc>, end: DateTime<Utc>, interval: Duration) -> Result<Self> {
        if end <= start {
            return Err(Error::config(format!("empty time window: {start} is not before {end}")));
        }
        let interval_ms = interval.as_millis() as i64;
        if interval_ms == 0 {
            return Err(Error::config("interval duration must be positive"));
        }
        let span_ms = (end - start).num_milliseconds();
        let count = (span_ms + interval_ms - 1) / interval_ms;
        Self::new(start, interval, count as usize)
    }

    pub fn from_days(start: DateTime<Utc>, days: u32, interval: Duration) -> Result<Self> {
        Self::covering(start, start + TimeDelta::days(days as i64), interval)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn interval_secs(&self) -> f64 {
        self.interval.as_secs_f64()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Exclusive end of the window.
    pub fn end(&self) -> DateTime<Utc> {
        self.timestamp(self.count)
    }

    /// Start timestamp of the interval at `index` (may be past the end).
    pub fn timestamp(&self, index: usize) -> DateTime<Utc> {
        self.start + TimeDelta::milliseconds(self.interval.as_millis() as i64 * index as i64)
    }

    /// Index of the interval containing `ts`, if it falls inside the window.
    pub fn index_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        if ts < self.start {
            return None;
        }
        let offset_ms = (ts - self.start).num_milliseconds();
        let index = (offset_ms / self.interval.as_millis() as i64) as usize;
        (index < self.count).then_some(index)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.index_of(ts).is_some()
    }

    /// Align `ts` down to the interval grid anchored at the window start.
    pub fn align_down(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = self.interval.as_millis() as i64;
        let offset_ms = (ts - self.start).num_milliseconds();
        self.start + TimeDelta::milliseconds(offset_ms.div_euclid(interval_ms) * interval_ms)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.count).map(|i| self.timestamp(i))
    }
}

/// Half-open timestamp range `[start, end)` used for storage queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl From<&TimeWindow> for TimeRange {
    fn from(window: &TimeWindow) -> Self {
        Self::new(window.start(), window.end())
    }
}

/// Bandwidth for one interval in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub timestamp: DateTime<Utc>,
    pub bps: f64,
}

/// Fraction of requests per HTTP status class. Always sums to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusDistribution {
    #[serde(rename = "2xx")]
    pub success: f64,
    #[serde(rename = "3xx")]
    pub redirect: f64,
    #[serde(rename = "4xx")]
    pub client_error: f64,
    #[serde(rename = "5xx")]
    pub server_error: f64,
}

impl Default for StatusDistribution {
    /// Healthy CDN baseline: 95% 2xx, 3% 3xx, 1.5% 4xx, 0.5% 5xx.
    fn default() -> Self {
        Self {
            success: 0.95,
            redirect: 0.03,
            client_error: 0.015,
            server_error: 0.005,
        }
    }
}

impl StatusDistribution {
    /// Build a distribution from raw weights, clamping negatives and renormalizing.
    ///
    /// Falls back to all-success when every weight is zero.
    pub fn normalized(weights: [f64; 4]) -> Self {
        let clamped = weights.map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 });
        let total: f64 = clamped.iter().sum();
        if total <= 0.0 {
            return Self {
                success: 1.0,
                redirect: 0.0,
                client_error: 0.0,
                server_error: 0.0,
            };
        }
        let [success, redirect, client_error, server_error] = clamped.map(|w| w / total);
        Self {
            success,
            redirect,
            client_error,
            server_error,
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.success, self.redirect, self.client_error, self.server_error]
    }

    pub fn total(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// Split `requests` into per-class counts that add back up to `requests`.
    ///
    /// Rounding slack lands in the 2xx bucket.
    pub fn counts(&self, requests: u64) -> [u64; 4] {
        let redirect = (requests as f64 * self.redirect).floor() as u64;
        let client_error = (requests as f64 * self.client_error).floor() as u64;
        let server_error = (requests as f64 * self.server_error).floor() as u64;
        let success = requests.saturating_sub(redirect + client_error + server_error);
        [success, redirect, client_error, server_error]
    }
}

/// One derived telemetry record for an (interval, domain, region) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub domain: String,
    pub region: String,
    pub country: String,
    pub interval_secs: u64,
    /// Bits per second attributed to this domain/region
    pub bandwidth_bps: f64,
    pub traffic_bytes: u64,
    pub request_count: u64,
    pub cache_hit_rate: f64,
    pub hit_count: u64,
    pub origin_traffic_bytes: u64,
    pub origin_request_count: u64,
    pub origin_fail_count: u64,
    pub status_codes: StatusDistribution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_kind: Option<AnomalyKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn jan1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_window_covering_one_day() {
        let start = jan1();
        let window = TimeWindow::covering(start, start + TimeDelta::days(1), Duration::from_secs(300)).unwrap();
        assert_eq!(window.len(), 288);
        assert_eq!(window.end(), start + TimeDelta::days(1));
    }

    #[test]
    fn test_window_rounds_partial_interval_up() {
        let start = jan1();
        let window = TimeWindow::covering(start, start + TimeDelta::seconds(301), Duration::from_secs(300)).unwrap();
        assert_eq!(window.len(), 2);

        let short = TimeWindow::covering(start, start + TimeDelta::seconds(10), Duration::from_secs(300)).unwrap();
        assert_eq!(short.len(), 1);
    }

    #[test]
    fn test_window_rejects_degenerate_input() {
        let start = jan1();
        assert!(TimeWindow::covering(start, start, Duration::from_secs(300)).is_err());
        assert!(TimeWindow::covering(start, start + TimeDelta::hours(1), Duration::ZERO).is_err());
        assert!(TimeWindow::new(start, Duration::from_secs(60), 0).is_err());
    }

    #[test]
    fn test_window_index_and_alignment() {
        let start = jan1();
        let window = TimeWindow::from_days(start, 1, Duration::from_secs(300)).unwrap();

        assert_eq!(window.index_of(start), Some(0));
        assert_eq!(window.index_of(start + TimeDelta::seconds(899)), Some(2));
        assert_eq!(window.index_of(start - TimeDelta::seconds(1)), None);
        assert_eq!(window.index_of(window.end()), None);
        assert!(window.contains(start));
        assert!(!window.contains(window.end()));

        let aligned = window.align_down(start + TimeDelta::seconds(3 * 300 + 17));
        assert_eq!(aligned, start + TimeDelta::seconds(900));
        assert_eq!(window.align_down(start - TimeDelta::seconds(1)), start - TimeDelta::seconds(300));
    }

    #[test]
    fn test_status_distribution_normalizes() {
        let dist = StatusDistribution::normalized([2.0, 1.0, -1.0, 1.0]);
        assert!((dist.total() - 1.0).abs() < 1e-12);
        assert_eq!(dist.client_error, 0.0);
        assert!((dist.success - 0.5).abs() < 1e-12);

        let fallback = StatusDistribution::normalized([0.0; 4]);
        assert_eq!(fallback.success, 1.0);
    }

    #[test]
    fn test_status_counts_add_up() {
        let dist = StatusDistribution::normalized([0.95, 0.03, 0.015, 0.005]);
        let counts = dist.counts(12_345);
        assert_eq!(counts.iter().sum::<u64>(), 12_345);
        assert!(counts[0] > counts[1]);
    }
}
