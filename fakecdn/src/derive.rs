//! Expands a bandwidth share into a full telemetry record.

use chrono::{DateTime, Utc};
use rand::prelude::RngExt;
use rand::rngs::StdRng;

use crate::anomaly::Effects;
use crate::config::RealismConfig;
use crate::types::{LogRecord, StatusDistribution};

/// Origin traffic grows by this fraction of the failure rate (retried fetches).
const ORIGIN_RETRY_INFLATION: f64 = 0.5;

/// Where a record belongs.
#[derive(Debug, Clone, Copy)]
pub struct RecordScope<'a> {
    pub timestamp: DateTime<Utc>,
    pub domain: &'a str,
    pub region: &'a str,
    pub country: &'a str,
}

#[derive(Debug, Clone)]
pub struct MetricDeriver {
    realism: RealismConfig,
    tenant_id: String,
    interval_secs: u64,
}

impl MetricDeriver {
    pub fn new(realism: RealismConfig, tenant_id: impl Into<String>, interval_secs: u64) -> Self {
        Self {
            realism,
            tenant_id: tenant_id.into(),
            interval_secs,
        }
    }

    pub fn derive(&self, scope: RecordScope<'_>, bandwidth_bps: f64, effects: &Effects, rng: &mut StdRng) -> LogRecord {
        let bandwidth_bps = bandwidth_bps.max(0.0);
        let traffic_bytes = (bandwidth_bps * self.interval_secs as f64 / 8.0).round() as u64;

        let object_bytes = self.realism.avg_object_size_kb.sample(rng) * 1024.0;
        let mut request_count = (traffic_bytes as f64 / object_bytes).round() as u64;
        if traffic_bytes > 0 {
            request_count = request_count.max(1);
        }

        let mut cache_hit_rate = self.realism.cache_hit_rate.sample(rng);
        if let Some(ceiling) = effects.hit_rate_ceiling {
            cache_hit_rate = cache_hit_rate.min(ceiling);
        }
        let baseline_fail_rate = self.realism.origin_fail_rate.sample(rng);
        let fail_rate = effects.origin_fail_rate.unwrap_or(baseline_fail_rate).clamp(0.0, 1.0);

        let mut origin_bytes = traffic_bytes as f64 * (1.0 - cache_hit_rate);
        if effects.origin_fail_rate.is_some() {
            origin_bytes *= 1.0 + fail_rate * ORIGIN_RETRY_INFLATION;
        }
        let origin_traffic_bytes = (origin_bytes.round() as u64).min(traffic_bytes);

        let hit_count = ((request_count as f64 * cache_hit_rate).round() as u64).min(request_count);
        let origin_request_count = request_count - hit_count;
        let origin_fail_count = ((origin_request_count as f64 * fail_rate).round() as u64).min(origin_request_count);

        let status_codes = self.status_distribution(effects, fail_rate, cache_hit_rate, rng);

        LogRecord {
            timestamp: scope.timestamp,
            tenant_id: self.tenant_id.clone(),
            domain: scope.domain.to_string(),
            region: scope.region.to_string(),
            country: scope.country.to_string(),
            interval_secs: self.interval_secs,
            bandwidth_bps,
            traffic_bytes,
            request_count,
            cache_hit_rate,
            hit_count,
            origin_traffic_bytes,
            origin_request_count,
            origin_fail_count,
            status_codes,
            anomaly_kind: effects.primary,
        }
    }

    /// Baseline jittered per class, then shifted by active effects and renormalized.
    fn status_distribution(
        &self,
        effects: &Effects,
        fail_rate: f64,
        cache_hit_rate: f64,
        rng: &mut StdRng,
    ) -> StatusDistribution {
        let jitter = self.realism.status_jitter;
        let [mut success, redirect, mut client_error, mut server_error] =
            StatusDistribution::normalized(self.realism.status_baseline.as_array())
                .as_array()
                .map(|fraction| {
                    if jitter > 0.0 {
                        fraction * (1.0 + rng.random_range(-jitter..=jitter))
                    } else {
                        fraction
                    }
                });

        // Failed origin fetches surface to clients as 5xx on the missed share of requests.
        let origin_5xx = if effects.origin_fail_rate.is_some() {
            fail_rate * (1.0 - cache_hit_rate)
        } else {
            0.0
        };
        let extra_4xx = effects.extra_client_error;
        let extra_5xx = effects.extra_server_error + origin_5xx;

        client_error += extra_4xx;
        server_error += extra_5xx;
        success -= extra_4xx + extra_5xx;

        StatusDistribution::normalized([success, redirect, client_error, server_error])
    }
}
