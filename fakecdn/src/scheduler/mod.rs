//! Drives generation in one of three modes and hands records to storage and transport.
//!
//! - **simulation**: the whole configured window in one pass, no pacing
//! - **catchup**: every interval of a historical `[start, end)` range, calibrated over that range
//!   alone, pushes throttled to the configured rate
//! - **realtime**: one interval per wall-clock interval boundary, resuming after the latest stored
//!   interval; past-due intervals are emitted immediately
//!
//! Every mode advances through [`Scheduler::emit`], which takes the current [`RunState`] and
//! returns the next one. Records of an interval are stored before they are pushed, and every push
//! of interval `i` finishes before interval `i + 1` is dispatched.

pub mod pusher;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use rand::prelude::RngExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::pipeline::{Generator, Periods};
use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::{LogRecord, TimeWindow};

pub use pusher::{PushStats, Pusher, RetryConfig};

/// Intervals generated and stored together in simulation and catchup (one day at 5 minutes).
const BATCH_INTERVALS: usize = 288;

/// Consecutive failed pushes after which every further failure is logged as backpressure.
const BACKPRESSURE_WARN_THRESHOLD: u64 = 50;

/// Source of wall-clock time for real-time pacing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Simulation,
    Realtime,
    Catchup,
}

/// Scheduler state, passed into and returned from every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub mode: RunMode,
    /// Start of the next interval to emit
    pub cursor: DateTime<Utc>,
    pub last_emitted: Option<DateTime<Utc>>,
    pub consecutive_push_failures: u64,
}

impl RunState {
    pub fn new(mode: RunMode, cursor: DateTime<Utc>) -> Self {
        Self {
            mode,
            cursor,
            last_emitted: None,
            consecutive_push_failures: 0,
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub intervals: u64,
    pub records_emitted: u64,
    pub records_stored: u64,
    pub pushed: u64,
    pub push_failures: u64,
    pub retries: u64,
    pub push_skipped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_interval: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_interval: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl RunSummary {
    fn new(mode: RunMode, seed: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            seed,
            started_at: Utc::now(),
            intervals: 0,
            records_emitted: 0,
            records_stored: 0,
            pushed: 0,
            push_failures: 0,
            retries: 0,
            push_skipped: 0,
            first_interval: None,
            last_interval: None,
            elapsed: Duration::ZERO,
        }
    }

    fn record_push(&mut self, stats: PushStats) {
        self.pushed += stats.pushed;
        self.push_failures += stats.failed;
        self.retries += stats.retries;
        self.push_skipped += stats.skipped;
    }
}

pub struct Scheduler {
    config: Config,
    periods: Periods,
    seed: u64,
    storage: Arc<dyn Storage>,
    pusher: Pusher,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    /// Most recently used generator; reused while timestamps fall inside its window
    current: Option<Generator>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let seed = match config.seed {
            Some(seed) => seed,
            None => {
                let seed = rand::rng().random::<u64>();
                warn!(seed, "No seed configured, drew a random one; restarts will not reproduce this run");
                seed
            }
        };
        let periods = Periods::new(&config, seed)?;
        let pusher = Pusher::new(transport, &config.push, shutdown.clone());

        Ok(Self {
            config,
            periods,
            seed,
            storage,
            pusher,
            clock: Arc::new(SystemClock),
            shutdown,
            current: None,
        })
    }

    /// Replace the wall clock used by real-time mode.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generator behind the most recently emitted interval.
    pub fn last_generator(&self) -> Option<&Generator> {
        self.current.as_ref()
    }

    fn step(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.periods.interval().as_millis() as i64)
    }

    /// Generator whose window holds `ts`, building the generation period's one if needed.
    fn generator(&mut self, ts: DateTime<Utc>) -> Result<&Generator> {
        if !self.current.as_ref().is_some_and(|g| g.window().contains(ts)) {
            let period = self.periods.period_of(ts);
            let generator = Generator::new(&self.config, self.periods.window(period), self.periods.seed(period))?;
            generator.log_stats();
            self.current = Some(generator);
        }
        self.current
            .as_ref()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("generator cache empty after build")))
    }

    /// Records for the intervals starting at `timestamps`, grouped per interval.
    fn records_for(&mut self, timestamps: &[DateTime<Utc>]) -> Result<Vec<Vec<LogRecord>>> {
        let mut out = Vec::with_capacity(timestamps.len());
        for ts in timestamps {
            let generator = self.generator(*ts)?;
            let records = match generator.window().index_of(*ts) {
                Some(index) => generator.records_at(index),
                None => Vec::new(),
            };
            out.push(records);
        }
        Ok(out)
    }

    /// Generate, store and push the given intervals in order, returning the advanced state.
    pub async fn emit(
        &mut self,
        state: RunState,
        timestamps: &[DateTime<Utc>],
        throttle: bool,
        summary: &mut RunSummary,
    ) -> Result<RunState> {
        let Some(&last) = timestamps.last() else {
            return Ok(state);
        };
        let batches = self.records_for(timestamps)?;

        let all: Vec<LogRecord> = batches.iter().flatten().cloned().collect();
        let stored = self.storage.append(&all).await?;
        summary.records_stored += stored;

        let mut consecutive = state.consecutive_push_failures;
        for (ts, records) in timestamps.iter().zip(batches) {
            let emitted = records.len() as u64;
            let stats = self.pusher.push_all(records, throttle).await;

            consecutive = if stats.pushed > 0 { 0 } else { consecutive + stats.failed };
            if stats.failed > 0 && consecutive >= BACKPRESSURE_WARN_THRESHOLD {
                warn!(
                    consecutive_failures = consecutive,
                    interval = %ts,
                    "Collector keeps rejecting pushes"
                );
            }
            debug!(interval = %ts, records = emitted, pushed = stats.pushed, failed = stats.failed, "Emitted interval");

            summary.intervals += 1;
            summary.records_emitted += emitted;
            summary.record_push(stats);
            summary.first_interval.get_or_insert(*ts);
            summary.last_interval = Some(*ts);
        }

        Ok(RunState {
            mode: state.mode,
            cursor: last + self.step(),
            last_emitted: Some(last),
            consecutive_push_failures: consecutive,
        })
    }

    /// Emit every interval of `window` in batches.
    async fn run_window(&mut self, mode: RunMode, window: TimeWindow, throttle: bool) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::new(mode, self.seed);
        let mut state = RunState::new(mode, window.start());
        let mut index = 0;

        while index < window.len() {
            if self.shutdown.is_cancelled() {
                info!(cursor = %state.cursor, "Stop requested, ending run");
                break;
            }
            // A batch never straddles two generators.
            let same_generator = |a: DateTime<Utc>, b: DateTime<Utc>| match &self.current {
                Some(g) if g.window().contains(a) => g.window().contains(b),
                _ => self.periods.period_of(a) == self.periods.period_of(b),
            };
            let first = window.timestamp(index);
            let mut end = index + 1;
            while end < window.len() && end - index < BATCH_INTERVALS && same_generator(first, window.timestamp(end)) {
                end += 1;
            }
            let timestamps: Vec<_> = (index..end).map(|i| window.timestamp(i)).collect();
            state = self.emit(state, &timestamps, throttle, &mut summary).await?;
            index = end;
        }

        summary.elapsed = started.elapsed();
        info!(
            run_id = %summary.run_id,
            intervals = summary.intervals,
            records = summary.records_emitted,
            pushed = summary.pushed,
            push_failures = summary.push_failures,
            elapsed = %humantime::format_duration(summary.elapsed),
            "Run complete"
        );
        Ok(summary)
    }

    /// Generate the whole configured window without pacing.
    #[instrument(skip(self), fields(seed = self.seed), err)]
    pub async fn run_simulation(&mut self) -> Result<RunSummary> {
        self.current = None;
        let window = self.periods.window(0);
        info!(start = %window.start(), end = %window.end(), intervals = window.len(), "Starting simulation");
        self.run_window(RunMode::Simulation, window, false).await
    }

    /// Backfill `[start, end)`, throttling pushes to the configured rate.
    ///
    /// The range gets its own generator, so its percentile lands on the target no matter where
    /// it sits inside a generation period.
    #[instrument(skip(self), fields(seed = self.seed), err)]
    pub async fn run_catchup(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RunSummary> {
        let aligned = self.periods.align_down(start);
        let window = TimeWindow::covering(aligned, end, self.periods.interval())?;
        info!(start = %aligned, end = %end, intervals = window.len(), "Starting catchup");

        let generator = Generator::new(&self.config, window, self.seed)?;
        generator.log_stats();
        self.current = Some(generator);
        self.run_window(RunMode::Catchup, window, true).await
    }

    /// Emit intervals as they start on the wall clock.
    ///
    /// Resumes after the latest stored interval, or at the current interval when the store is
    /// empty. Stops at `until` (exclusive), on cancellation, or after one interval with `once`.
    #[instrument(skip(self), fields(seed = self.seed), err)]
    pub async fn run_realtime(&mut self, once: bool, until: Option<DateTime<Utc>>) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::new(RunMode::Realtime, self.seed);
        self.current = None;

        let cursor = match self.storage.max_timestamp().await? {
            Some(last) => {
                let cursor = self.periods.align_down(last) + self.step();
                info!(last_stored = %last, cursor = %cursor, "Resuming after latest stored interval");
                cursor
            }
            None => {
                let cursor = self.periods.align_down(self.clock.now());
                info!(cursor = %cursor, "Store is empty, starting at the current interval");
                cursor
            }
        };
        let mut state = RunState::new(RunMode::Realtime, cursor);

        loop {
            if until.is_some_and(|until| state.cursor >= until) {
                info!(cursor = %state.cursor, "Reached end of real-time window");
                break;
            }
            if self.shutdown.is_cancelled() {
                info!(cursor = %state.cursor, "Stop requested, ending run");
                break;
            }

            let now = self.clock.now();
            if state.cursor > now {
                let wait = (state.cursor - now).to_std().unwrap_or_default();
                debug!(next = %state.cursor, wait_ms = wait.as_millis() as u64, "Waiting for next interval");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.shutdown.cancelled() => {
                        info!(cursor = %state.cursor, "Stop requested while waiting");
                        break;
                    }
                }
                continue;
            }

            if now - state.cursor >= self.step() {
                debug!(interval = %state.cursor, "Filling past-due interval");
            }
            let cursor = state.cursor;
            state = self.emit(state, &[cursor], false, &mut summary).await?;

            if once {
                break;
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            run_id = %summary.run_id,
            intervals = summary.intervals,
            records = summary.records_emitted,
            pushed = summary.pushed,
            push_failures = summary.push_failures,
            elapsed = %humantime::format_duration(summary.elapsed),
            "Real-time run stopped"
        );
        Ok(summary)
    }
}
