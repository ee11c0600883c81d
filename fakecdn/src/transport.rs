//! Push transport: one record per HTTP POST.
//!
//! The collector expects the historical field names (`tenantId`, `start_time` in milliseconds,
//! `bw` in Mbps, `flux`/`bs_flux` in bytes, per-class status counts, ...). [`WirePayload`] is the
//! only place that knows about them; the rest of the crate works on [`LogRecord`].
//!
//! Delivery is at-least-once. A retried push may reach the collector twice.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::PushConfig;
use crate::errors::Error;
use crate::types::LogRecord;

#[derive(Error, Debug)]
pub enum PushError {
    /// Collector answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection, TLS or protocol failure
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The attempt did not finish within the per-attempt timeout
    #[error("Push timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(&self, record: &LogRecord) -> Result<(), PushError>;

    /// Whether pushes are suppressed entirely.
    fn dry_run(&self) -> bool {
        false
    }
}

/// Record in the collector's wire format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WirePayload<'a> {
    #[serde(rename = "tenantId")]
    pub tenant_id: &'a str,
    /// Interval start, unix milliseconds
    pub start_time: i64,
    pub country: &'a str,
    pub region: &'a str,
    pub domain: &'a str,
    /// Interval length in seconds
    pub interval: u64,
    /// Bandwidth in Mbps
    pub bw: u64,
    pub flux: u64,
    /// Origin bandwidth in Mbps
    pub bs_bw: u64,
    pub bs_flux: u64,
    pub req_num: u64,
    pub hit_num: u64,
    pub bs_num: u64,
    pub bs_fail_num: u64,
    pub hit_flux: u64,
    pub http_code_2xx: u64,
    pub http_code_3xx: u64,
    pub http_code_4xx: u64,
    pub http_code_5xx: u64,
    pub bs_http_code_2xx: u64,
    pub bs_http_code_3xx: u64,
    pub bs_http_code_4xx: u64,
    pub bs_http_code_5xx: u64,
}

impl<'a> From<&'a LogRecord> for WirePayload<'a> {
    fn from(r: &'a LogRecord) -> Self {
        let [c2xx, c3xx, c4xx, c5xx] = r.status_codes.counts(r.request_count);

        // Origin responses: failed fetches are 5xx, the rest follow the client 3xx/4xx mix.
        let origin = r.origin_request_count;
        let bs_3xx = ((origin as f64 * r.status_codes.redirect).floor() as u64).min(origin - r.origin_fail_count);
        let bs_4xx =
            ((origin as f64 * r.status_codes.client_error).floor() as u64).min(origin - r.origin_fail_count - bs_3xx);
        let bs_2xx = origin - r.origin_fail_count - bs_3xx - bs_4xx;

        let secs = r.interval_secs.max(1) as f64;
        Self {
            tenant_id: &r.tenant_id,
            start_time: r.timestamp.timestamp_millis(),
            country: &r.country,
            region: &r.region,
            domain: &r.domain,
            interval: r.interval_secs,
            bw: (r.bandwidth_bps / 1e6).round() as u64,
            flux: r.traffic_bytes,
            bs_bw: (r.origin_traffic_bytes as f64 * 8.0 / secs / 1e6).round() as u64,
            bs_flux: r.origin_traffic_bytes,
            req_num: r.request_count,
            hit_num: r.hit_count,
            bs_num: origin,
            bs_fail_num: r.origin_fail_count,
            hit_flux: r.traffic_bytes.saturating_sub(r.origin_traffic_bytes),
            http_code_2xx: c2xx,
            http_code_3xx: c3xx,
            http_code_4xx: c4xx,
            http_code_5xx: c5xx,
            bs_http_code_2xx: bs_2xx,
            bs_http_code_3xx: bs_3xx,
            bs_http_code_4xx: bs_4xx,
            bs_http_code_5xx: r.origin_fail_count,
        }
    }
}

/// POSTs records as JSON to the collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    headers: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(endpoint: Url, headers: HashMap<String, String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            headers,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn push(&self, record: &LogRecord) -> Result<(), PushError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&WirePayload::from(record));
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), domain = %record.domain, "Pushed record");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PushError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        })
    }
}

/// Accepts every record without any I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunTransport;

#[async_trait]
impl Transport for DryRunTransport {
    async fn push(&self, _record: &LogRecord) -> Result<(), PushError> {
        Ok(())
    }

    fn dry_run(&self) -> bool {
        true
    }
}

/// Transport selected by the push configuration.
pub fn from_config(config: &PushConfig) -> Result<std::sync::Arc<dyn Transport>, Error> {
    match (&config.endpoint, config.dry_run) {
        (Some(endpoint), false) => Ok(std::sync::Arc::new(HttpTransport::new(
            endpoint.clone(),
            config.headers.clone(),
            config.timeout,
        )?)),
        (None, false) => Err(Error::config("push.endpoint is required unless push.dry_run is set")),
        (_, true) => Ok(std::sync::Arc::new(DryRunTransport)),
    }
}
