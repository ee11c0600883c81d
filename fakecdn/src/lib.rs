//! # fakecdn: synthetic CDN telemetry calibrated to a 95th-percentile billing target
//!
//! `fakecdn` produces realistic-looking CDN access telemetry (bandwidth, traffic, requests, cache
//! hits, origin fetches and status-code mixes per domain and region) whose aggregate bandwidth
//! series lands exactly on a configured billing percentile. It exists to exercise billing and
//! monitoring pipelines without real traffic.
//!
//! ## Pipeline
//!
//! ```text
//! config ─► CurveSynthesizer ─► AnomalyInjector ─► MetricDeriver ─► Scheduler ─┬─► Storage
//!           (shape + noise,      (per-region        (per domain/     (simulation,├─► Transport
//!            bursts, calibrate)   events)            region records)  realtime,  │
//!                                                                     catchup)   └─► Validator
//! ```
//!
//! The **curve synthesizer** ([`curve`]) builds one sample per interval from a daily cycle, a
//! weekly profile and a month-edge trend, adds noise and short bursts, then rescales the whole
//! series so its nearest-rank percentile equals the target. The calibrated curve is the source of
//! truth for bandwidth: nothing downstream changes it.
//!
//! The **anomaly injector** ([`anomaly`]) plans origin failures, cache purges, DDoS bursts and
//! maintenance windows per region. Anomalies affect derived metrics (cache hit rate, origin
//! failures, status codes) but never bandwidth, so calibration survives injection.
//!
//! The **metric deriver** ([`derive`]) turns a bandwidth share into a full [`types::LogRecord`]:
//! traffic from bandwidth, requests from a sampled object size, hits and origin fetches from a
//! sampled hit rate, and a normalized status distribution.
//!
//! The [`pipeline`] module ties the three together for one generation window, and the
//! **scheduler** ([`scheduler`]) walks windows in simulation, real-time or catchup mode, storing
//! each interval before pushing it through the [`transport`] with bounded retries.
//!
//! The **validator** ([`validator`]) reads records back, rebuilds the aggregate series and checks
//! the percentile against the target, and [`billing`] prices the result. Runs can also leave
//! JSON artifacts in an output directory ([`export`]), which the validator reads back offline.
//!
//! ## Configuration
//!
//! Configuration is YAML plus `FAKECDN_`-prefixed environment overrides, loaded through
//! [`config::Config::load`]. Every value has a default; see [`config`] for the full layout.

pub mod anomaly;
pub mod billing;
pub mod config;
pub mod curve;
pub mod derive;
pub mod errors;
pub mod export;
pub mod pipeline;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod validator;

#[cfg(test)]
mod test;
#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use errors::{Error, Result};
