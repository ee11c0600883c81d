//! Push discipline: bounded worker pool, optional rate throttle, retries with backoff.
//!
//! ```text
//! push_all(records)
//!   └─ for each record:
//!        ├─ throttle tick (catchup only)
//!        ├─ acquire semaphore permit (caps concurrency)
//!        └─ spawn push_with_retry ─┐
//!                                  ├─ attempt with per-attempt timeout
//!                                  ├─ on failure: sleep backoff_ms × factor^attempt (capped)
//!                                  └─ after max_retries: log + count, never fatal
//!   └─ join every task before returning
//! ```
//!
//! Cancellation stops dispatching new records and cuts retry backoff short; pushes already in
//! flight are awaited before `push_all` returns.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PushConfig;
use crate::transport::{PushError, Transport};
use crate::types::LogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl From<&PushConfig> for RetryConfig {
    fn from(config: &PushConfig) -> Self {
        RetryConfig {
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_attempt + 1`.
    pub fn backoff(&self, retry_attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(retry_attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}

/// Push outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushStats {
    pub pushed: u64,
    pub failed: u64,
    pub retries: u64,
    /// Records never attempted (dry-run or cancelled before dispatch)
    pub skipped: u64,
}

impl std::ops::AddAssign for PushStats {
    fn add_assign(&mut self, rhs: Self) {
        self.pushed += rhs.pushed;
        self.failed += rhs.failed;
        self.retries += rhs.retries;
        self.skipped += rhs.skipped;
    }
}

pub struct Pusher {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
    /// Minimum spacing between dispatches when throttled
    throttle_period: Option<Duration>,
    shutdown: CancellationToken,
}

impl Pusher {
    pub fn new(transport: Arc<dyn Transport>, config: &PushConfig, shutdown: CancellationToken) -> Self {
        Self {
            transport,
            retry: RetryConfig::from(config),
            timeout: config.timeout,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_pushes.max(1))),
            throttle_period: (config.rate_limit_per_sec > 0)
                .then(|| Duration::from_secs_f64(1.0 / config.rate_limit_per_sec as f64)),
            shutdown,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.transport.dry_run()
    }

    /// Push every record and wait for all of them. `throttle` applies the configured rate limit.
    pub async fn push_all(&self, records: Vec<LogRecord>, throttle: bool) -> PushStats {
        let total = records.len() as u64;
        if self.transport.dry_run() {
            return PushStats {
                skipped: total,
                ..PushStats::default()
            };
        }

        let mut ticker = self.throttle_period.filter(|_| throttle).map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let mut stats = PushStats::default();
        let mut tasks = JoinSet::new();
        let mut dispatched = 0u64;

        for record in records {
            if let Some(ticker) = ticker.as_mut() {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        warn!("Push semaphore closed");
                        break;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            let transport = self.transport.clone();
            let retry = self.retry;
            let timeout = self.timeout;
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                push_with_retry(transport.as_ref(), &record, retry, timeout, &shutdown).await
            });
            dispatched += 1;
        }

        if dispatched < total {
            debug!(skipped = total - dispatched, "Stopped dispatching pushes");
            stats.skipped += total - dispatched;
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => stats += outcome,
                Err(e) => {
                    warn!(error = %e, "Push task panicked");
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

async fn attempt(transport: &dyn Transport, record: &LogRecord, timeout: Duration) -> Result<(), PushError> {
    match tokio::time::timeout(timeout, transport.push(record)).await {
        Ok(result) => result,
        Err(_) => Err(PushError::Timeout(timeout)),
    }
}

/// Push one record, retrying with exponential backoff. Returns that record's counters.
pub async fn push_with_retry(
    transport: &dyn Transport,
    record: &LogRecord,
    retry: RetryConfig,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> PushStats {
    let mut stats = PushStats::default();
    let mut retry_attempt = 0u32;

    loop {
        match attempt(transport, record, timeout).await {
            Ok(()) => {
                counter!("fakecdn_pushes_total", "outcome" => "success").increment(1);
                stats.pushed = 1;
                return stats;
            }
            Err(e) if retry_attempt < retry.max_retries => {
                let backoff = retry.backoff(retry_attempt);
                counter!("fakecdn_pushes_total", "outcome" => "retry").increment(1);
                debug!(
                    timestamp = %record.timestamp,
                    domain = %record.domain,
                    region = %record.region,
                    retry_attempt = retry_attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Push failed, retrying"
                );
                stats.retries += 1;
                retry_attempt += 1;

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => {
                        warn!(timestamp = %record.timestamp, domain = %record.domain, "Shutdown during push backoff, giving up");
                        counter!("fakecdn_pushes_total", "outcome" => "failure").increment(1);
                        stats.failed = 1;
                        return stats;
                    }
                }
            }
            Err(e) => {
                counter!("fakecdn_pushes_total", "outcome" => "failure").increment(1);
                warn!(
                    timestamp = %record.timestamp,
                    domain = %record.domain,
                    region = %record.region,
                    attempts = retry_attempt + 1,
                    error = %e,
                    "Push failed, retries exhausted"
                );
                stats.failed = 1;
                return stats;
            }
        }
    }
}
