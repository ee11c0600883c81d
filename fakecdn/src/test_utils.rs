//! Helpers shared by unit and end-to-end tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::config::Config;
use crate::scheduler::Clock;
use crate::transport::{PushError, Transport};
use crate::types::{LogRecord, StatusDistribution};

/// A plausible 1 Gbps record for `(timestamp, domain, region)`.
pub fn record_at(timestamp: DateTime<Utc>, domain: &str, region: &str) -> LogRecord {
    LogRecord {
        timestamp,
        tenant_id: "tenant-001".to_string(),
        domain: domain.to_string(),
        region: region.to_string(),
        country: "US".to_string(),
        interval_secs: 300,
        bandwidth_bps: 1e9,
        traffic_bytes: 37_500_000_000,
        request_count: 36_621,
        cache_hit_rate: 0.9,
        hit_count: 32_959,
        origin_traffic_bytes: 3_750_000_000,
        origin_request_count: 3_662,
        origin_fail_count: 18,
        status_codes: StatusDistribution::default(),
        anomaly_kind: None,
    }
}

/// Small deterministic configuration: two days, two regions, two domains, dry-run, no storage.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.seed = Some(42);
    config.time.duration_days = 2;
    config.dimensions.regions.truncate(2);
    config.dimensions.domains.truncate(2);
    config.storage.enabled = false;
    config.push.backoff_ms = 10;
    config.push.max_backoff_ms = 40;
    config.push.rate_limit_per_sec = 0;
    config
}

/// Transport that fails the first `failures` attempts of every record, then succeeds.
#[derive(Debug, Default)]
pub struct FlakyTransport {
    failures: usize,
    delay: Option<Duration>,
    attempts: Mutex<std::collections::HashMap<(DateTime<Utc>, String, String), usize>>,
    pub calls: AtomicUsize,
    pub delivered: Mutex<Vec<LogRecord>>,
}

impl FlakyTransport {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    /// Every attempt takes `delay` before answering.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<LogRecord> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn push(&self, record: &LogRecord) -> Result<(), PushError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let key = (record.timestamp, record.domain.clone(), record.region.clone());
            let n = attempts.entry(key).or_insert(0);
            *n += 1;
            *n
        };
        if attempt <= self.failures {
            return Err(PushError::Status {
                status: 503,
                body: format!("attempt {attempt}"),
            });
        }
        self.delivered.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Wall clock that follows tokio's (pausable) time from a fixed origin.
#[derive(Debug, Clone)]
pub struct PausedClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl PausedClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin + TimeDelta::from_std(self.started.elapsed()).unwrap()
    }
}
