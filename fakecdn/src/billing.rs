//! 95th-percentile cost compared against per-GB traffic billing for the same records.

use serde::{Deserialize, Serialize};

use crate::config::BillingConfig;
use crate::validator::ValidationResult;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BillingReport {
    pub p95_gbps: f64,
    pub unit_price_per_gbps: f64,
    /// p95 Gbps × unit price
    pub percentile_cost: f64,
    /// Decimal gigabytes (1e9 bytes)
    pub total_traffic_gb: f64,
    pub traffic_price_per_gb: f64,
    pub traffic_cost: f64,
    /// Positive when percentile billing is cheaper
    pub saving: f64,
    pub saving_percent: f64,
}

impl BillingReport {
    pub fn new(p95_gbps: f64, total_traffic_bytes: u64, config: &BillingConfig) -> Self {
        let percentile_cost = p95_gbps * config.unit_price_per_gbps;
        let total_traffic_gb = total_traffic_bytes as f64 / 1e9;
        let traffic_cost = total_traffic_gb * config.traffic_price_per_gb;
        let saving = traffic_cost - percentile_cost;
        let saving_percent = if traffic_cost > 0.0 {
            saving / traffic_cost * 100.0
        } else {
            0.0
        };
        Self {
            p95_gbps,
            unit_price_per_gbps: config.unit_price_per_gbps,
            percentile_cost,
            total_traffic_gb,
            traffic_price_per_gb: config.traffic_price_per_gb,
            traffic_cost,
            saving,
            saving_percent,
        }
    }

    pub fn from_validation(result: &ValidationResult, config: &BillingConfig) -> Self {
        Self::new(result.p95_gbps, result.total_traffic_bytes, config)
    }

    pub fn percentile_is_cheaper(&self) -> bool {
        self.saving > 0.0
    }
}
