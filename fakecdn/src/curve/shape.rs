//! Deterministic shape multipliers keyed by local time.

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};

use crate::config::{DailyPattern, PatternConfig, TimeBasis};
use crate::types::TimeWindow;

/// Product of the daily, weekly and monthly multipliers for a timestamp.
#[derive(Debug, Clone)]
pub struct Shape {
    pattern: PatternConfig,
    basis: TimeBasis,
}

impl Shape {
    pub fn new(pattern: PatternConfig, basis: TimeBasis) -> Self {
        Self { pattern, basis }
    }

    pub fn factor(&self, window: &TimeWindow, ts: DateTime<Utc>) -> f64 {
        let local = self.basis.localize(ts);
        let hour = local.hour() as f64 + local.minute() as f64 / 60.0 + local.second() as f64 / 3600.0;
        let weekday = local.weekday().num_days_from_monday() as usize;

        daily(&self.pattern.daily, hour)
            * self.pattern.weekly.get(weekday).copied().unwrap_or(1.0)
            * self.monthly(window, ts)
    }

    /// Edge factor for the first and last `month_edge_days` of the window.
    pub fn monthly(&self, window: &TimeWindow, ts: DateTime<Utc>) -> f64 {
        let edge = self.pattern.month_edge_days as i64;
        if edge == 0 {
            return 1.0;
        }
        let day = (ts - window.start()).num_days();
        let span = window.end() - window.start();
        let total_days = (span + TimeDelta::days(1) - TimeDelta::milliseconds(1)).num_days();
        if day < edge || day >= total_days - edge {
            self.pattern.month_edge_factor
        } else {
            1.0
        }
    }
}

/// Time-of-day multiplier at fractional local `hour`.
pub fn daily(pattern: &DailyPattern, hour: f64) -> f64 {
    match &pattern.hourly {
        Some(table) if table.len() == 24 => {
            let hour = hour.rem_euclid(24.0);
            let lower = hour.floor() as usize % 24;
            let upper = (lower + 1) % 24;
            let frac = hour - hour.floor();
            table[lower] * (1.0 - frac) + table[upper] * frac
        }
        _ => {
            let phase = 2.0 * PI * (hour - pattern.peak_hour) / 24.0;
            pattern.low + (pattern.high - pattern.low) * (0.5 + 0.5 * phase.cos())
        }
    }
}
