//! Anomaly injection.
//!
//! Anomalies are planned once per generation window: every interval, on every scope (region),
//! each kind gets one trigger roll unless an event of that kind is already running there. The
//! resulting [`AnomalyPlan`] is a pure function of the window and the seeded generator, so a
//! restarted real-time run sees exactly the same events.
//!
//! Events only bias derived metrics (cache behaviour, origin failures, status codes). They never
//! touch bandwidth, so the calibrated aggregate percentile is unaffected.

use std::fmt;

use chrono::Timelike;
use rand::prelude::RngExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AnomalyConfig, AnomalyKindConfig, TimeBasis};
use crate::types::TimeWindow;

/// Kinds of injected events, in priority order (the first active kind labels a record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    OriginFailure,
    Ddos,
    Maintenance,
    CachePurge,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 4] = [
        AnomalyKind::OriginFailure,
        AnomalyKind::Ddos,
        AnomalyKind::Maintenance,
        AnomalyKind::CachePurge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::OriginFailure => "origin_failure",
            AnomalyKind::Ddos => "ddos",
            AnomalyKind::Maintenance => "maintenance",
            AnomalyKind::CachePurge => "cache_purge",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// The effect an event of this kind has at `magnitude` (0 = mildest, 1 = strongest).
    pub fn effect(self, magnitude: f64) -> Effect {
        let m = magnitude.clamp(0.0, 1.0);
        match self {
            AnomalyKind::OriginFailure => Effect::OriginFailure {
                fail_rate: 0.3 + 0.5 * m,
            },
            AnomalyKind::CachePurge => Effect::CachePurge {
                hit_rate_ceiling: 0.7 - 0.2 * m,
            },
            AnomalyKind::Ddos => Effect::Ddos {
                extra_client_error: 0.2 + 0.2 * m,
            },
            AnomalyKind::Maintenance => Effect::Maintenance {
                extra_server_error: 0.05 + 0.10 * m,
            },
        }
    }

    fn settings(self, config: &AnomalyConfig) -> &AnomalyKindConfig {
        match self {
            AnomalyKind::OriginFailure => &config.origin_failure,
            AnomalyKind::CachePurge => &config.cache_purge,
            AnomalyKind::Ddos => &config.ddos,
            AnomalyKind::Maintenance => &config.maintenance,
        }
    }

    fn index(self) -> usize {
        match self {
            AnomalyKind::OriginFailure => 0,
            AnomalyKind::Ddos => 1,
            AnomalyKind::Maintenance => 2,
            AnomalyKind::CachePurge => 3,
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single active event does to the metrics of its scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    /// Origin fetches fail at this rate; retries inflate origin traffic
    OriginFailure { fail_rate: f64 },
    /// Cache hit rate is pulled down to at most this value
    CachePurge { hit_rate_ceiling: f64 },
    /// Extra fraction of requests answered with 4xx
    Ddos { extra_client_error: f64 },
    /// Extra fraction of requests answered with 5xx
    Maintenance { extra_server_error: f64 },
}

/// Combined effect of every event active on a scope at one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Effects {
    pub origin_fail_rate: Option<f64>,
    pub hit_rate_ceiling: Option<f64>,
    pub extra_client_error: f64,
    pub extra_server_error: f64,
    /// Highest-priority active kind
    pub primary: Option<AnomalyKind>,
}

impl Effects {
    pub fn is_quiet(&self) -> bool {
        self.primary.is_none()
    }

    /// Fold one active event into the combined effects.
    pub fn add(&mut self, kind: AnomalyKind, effect: Effect) {
        match effect {
            Effect::OriginFailure { fail_rate } => {
                self.origin_fail_rate = Some(self.origin_fail_rate.map_or(fail_rate, |f| f.max(fail_rate)));
            }
            Effect::CachePurge { hit_rate_ceiling } => {
                self.hit_rate_ceiling =
                    Some(self.hit_rate_ceiling.map_or(hit_rate_ceiling, |c| c.min(hit_rate_ceiling)));
            }
            Effect::Ddos { extra_client_error } => self.extra_client_error += extra_client_error,
            Effect::Maintenance { extra_server_error } => self.extra_server_error += extra_server_error,
        }
        if self.primary.is_none_or(|p| kind < p) {
            self.primary = Some(kind);
        }
    }
}

/// A bounded-duration event on one scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub kind: AnomalyKind,
    /// Region index the event applies to
    pub scope: usize,
    /// First interval index
    pub start: usize,
    /// Length in intervals, already truncated at the window end
    pub duration: usize,
    pub magnitude: f64,
}

impl AnomalyEvent {
    /// Exclusive end interval index.
    pub fn end(&self) -> usize {
        self.start + self.duration
    }

    pub fn is_active(&self, index: usize) -> bool {
        index >= self.start && index < self.end()
    }

    pub fn effect(&self) -> Effect {
        self.kind.effect(self.magnitude)
    }
}

/// Every event of a window, grouped by scope and ordered by start.
#[derive(Debug, Clone, Default)]
pub struct AnomalyPlan {
    by_scope: Vec<Vec<AnomalyEvent>>,
}

impl AnomalyPlan {
    /// A plan without events.
    pub fn quiet(scopes: usize) -> Self {
        Self {
            by_scope: vec![Vec::new(); scopes],
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &AnomalyEvent> {
        self.by_scope.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_scope.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: AnomalyKind) -> usize {
        self.events().filter(|e| e.kind == kind).count()
    }

    /// Combined effects on `scope` at interval `index`.
    pub fn effects_at(&self, scope: usize, index: usize) -> Effects {
        let mut effects = Effects::default();
        let Some(events) = self.by_scope.get(scope) else {
            return effects;
        };
        for event in events.iter().take_while(|e| e.start <= index) {
            if event.is_active(index) {
                effects.add(event.kind, event.effect());
            }
        }
        effects
    }
}

/// Plans anomaly events for a window.
#[derive(Debug, Clone)]
pub struct AnomalyInjector {
    config: AnomalyConfig,
    basis: TimeBasis,
}

impl AnomalyInjector {
    pub fn new(config: AnomalyConfig, basis: TimeBasis) -> Self {
        Self { config, basis }
    }

    /// Roll events for every interval of `window` on `scopes` scopes.
    ///
    /// Draw order is interval, then scope, then kind; a kind that is already active on a scope
    /// consumes no randomness.
    pub fn plan(&self, window: &TimeWindow, scopes: usize, rng: &mut StdRng) -> AnomalyPlan {
        if !self.config.enabled {
            return AnomalyPlan::quiet(scopes);
        }

        let n = window.len();
        let mut plan = AnomalyPlan::quiet(scopes);
        // Exclusive end of the running event, per scope and kind.
        let mut busy_until = vec![[0usize; 4]; scopes];

        for index in 0..n {
            let hour = self.basis.localize(window.timestamp(index)).hour();
            let in_maintenance_window = self.config.maintenance_hours.contains(hour);

            for (scope, busy) in busy_until.iter_mut().enumerate() {
                for kind in AnomalyKind::ALL {
                    if index < busy[kind.index()] {
                        continue;
                    }
                    if kind == AnomalyKind::Maintenance && !in_maintenance_window {
                        continue;
                    }
                    let settings = kind.settings(&self.config);
                    if settings.probability <= 0.0 || !rng.random_bool(settings.probability) {
                        continue;
                    }

                    let wanted = settings.duration_intervals.sample(rng) as usize;
                    let duration = wanted.min(n - index);
                    let event = AnomalyEvent {
                        kind,
                        scope,
                        start: index,
                        duration,
                        magnitude: settings.magnitude.sample(rng),
                    };
                    debug!(
                        kind = %kind,
                        scope,
                        start = index,
                        duration,
                        magnitude = event.magnitude,
                        "Planned anomaly"
                    );
                    busy[kind.index()] = event.end();
                    plan.by_scope[scope].push(event);
                }
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HourWindow, IntervalRange};
    use chrono::{TimeZone, Utc};
    use rand::SeedableRng;
    use std::time::Duration;

    fn day_window() -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        TimeWindow::from_days(start, 1, Duration::from_secs(300)).unwrap()
    }

    fn noisy_config() -> AnomalyConfig {
        let mut config = AnomalyConfig::default();
        config.origin_failure.probability = 0.2;
        config.cache_purge.probability = 0.2;
        config.ddos.probability = 0.2;
        config.maintenance.probability = 0.5;
        config
    }

    #[test]
    fn test_same_kind_events_never_overlap_on_a_scope() {
        let injector = AnomalyInjector::new(noisy_config(), TimeBasis::Utc);
        let window = day_window();
        let plan = injector.plan(&window, 3, &mut StdRng::seed_from_u64(7));
        assert!(!plan.is_empty());

        for scope in 0..3 {
            for kind in AnomalyKind::ALL {
                let mut events: Vec<_> = plan.events().filter(|e| e.scope == scope && e.kind == kind).collect();
                events.sort_by_key(|e| e.start);
                for pair in events.windows(2) {
                    assert!(pair[0].end() <= pair[1].start, "{kind} overlaps on scope {scope}: {pair:?}");
                }
            }
        }
    }

    #[test]
    fn test_events_are_truncated_at_window_end() {
        let mut config = noisy_config();
        config.ddos.probability = 1.0;
        config.ddos.duration_intervals = IntervalRange(50, 50);
        let injector = AnomalyInjector::new(config, TimeBasis::Utc);
        let window = day_window();
        let plan = injector.plan(&window, 1, &mut StdRng::seed_from_u64(1));

        for event in plan.events() {
            assert!(event.end() <= window.len());
        }
        let last_ddos = plan.events().filter(|e| e.kind == AnomalyKind::Ddos).max_by_key(|e| e.start).unwrap();
        assert_eq!(last_ddos.end(), window.len());
        assert!(last_ddos.duration < 50);
    }

    #[test]
    fn test_maintenance_respects_local_hours() {
        let mut config = noisy_config();
        config.maintenance.probability = 1.0;
        config.maintenance.duration_intervals = IntervalRange(1, 1);
        config.maintenance_hours = HourWindow { start: 2, end: 5 };

        let window = day_window();
        let plan = AnomalyInjector::new(config.clone(), TimeBasis::Utc).plan(&window, 1, &mut StdRng::seed_from_u64(3));
        for event in plan.events().filter(|e| e.kind == AnomalyKind::Maintenance) {
            let hour = window.timestamp(event.start).hour();
            assert!((2..5).contains(&hour), "maintenance started at {hour}:00 UTC");
        }
        // Probability 1 with single-interval events fills the whole three hour window.
        assert_eq!(plan.count(AnomalyKind::Maintenance), 36);

        // Same local window in UTC+8 starts at 18:00 UTC of the previous day.
        let basis: TimeBasis = "+08:00".parse().unwrap();
        let plan = AnomalyInjector::new(config, basis).plan(&window, 1, &mut StdRng::seed_from_u64(3));
        for event in plan.events().filter(|e| e.kind == AnomalyKind::Maintenance) {
            let hour = window.timestamp(event.start).hour();
            assert!((18..21).contains(&hour), "maintenance started at {hour}:00 UTC");
        }
    }

    #[test]
    fn test_effects_only_inside_active_range() {
        let mut config = AnomalyConfig::default();
        for kind in [&mut config.origin_failure, &mut config.ddos, &mut config.maintenance] {
            kind.probability = 0.0;
        }
        config.cache_purge.probability = 0.3;
        let window = day_window();
        let plan = AnomalyInjector::new(config, TimeBasis::Utc).plan(&window, 2, &mut StdRng::seed_from_u64(11));

        for scope in 0..2 {
            for index in 0..window.len() {
                let active = plan
                    .events()
                    .any(|e| e.scope == scope && e.is_active(index));
                let effects = plan.effects_at(scope, index);
                assert_eq!(effects.is_quiet(), !active);
                if active {
                    assert_eq!(effects.primary, Some(AnomalyKind::CachePurge));
                    let ceiling = effects.hit_rate_ceiling.unwrap();
                    assert!((0.5..=0.7).contains(&ceiling));
                }
            }
        }
    }

    #[test]
    fn test_plan_is_reproducible_for_a_seed() {
        let injector = AnomalyInjector::new(noisy_config(), TimeBasis::Utc);
        let window = day_window();
        let a = injector.plan(&window, 4, &mut StdRng::seed_from_u64(42));
        let b = injector.plan(&window, 4, &mut StdRng::seed_from_u64(42));
        let a: Vec<_> = a.events().copied().collect();
        let b: Vec<_> = b.events().copied().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_disabled_plan_is_quiet() {
        let mut config = noisy_config();
        config.enabled = false;
        let plan = AnomalyInjector::new(config, TimeBasis::Utc).plan(&day_window(), 3, &mut StdRng::seed_from_u64(0));
        assert!(plan.is_empty());
        assert!(plan.effects_at(0, 10).is_quiet());
    }

    #[test]
    fn test_effect_ranges() {
        for kind in AnomalyKind::ALL {
            for m in [0.0, 0.5, 1.0] {
                match kind.effect(m) {
                    Effect::OriginFailure { fail_rate } => assert!((0.3..=0.8).contains(&fail_rate)),
                    Effect::CachePurge { hit_rate_ceiling } => assert!((0.5..=0.7).contains(&hit_rate_ceiling)),
                    Effect::Ddos { extra_client_error } => assert!((0.2..=0.4).contains(&extra_client_error)),
                    Effect::Maintenance { extra_server_error } => {
                        assert!((0.05..=0.15 + 1e-12).contains(&extra_server_error))
                    }
                }
            }
        }
    }

    #[test]
    fn test_primary_kind_follows_priority() {
        let mut effects = Effects::default();
        effects.add(AnomalyKind::CachePurge, AnomalyKind::CachePurge.effect(0.5));
        effects.add(AnomalyKind::Ddos, AnomalyKind::Ddos.effect(0.5));
        assert_eq!(effects.primary, Some(AnomalyKind::Ddos));
        effects.add(AnomalyKind::OriginFailure, AnomalyKind::OriginFailure.effect(0.5));
        assert_eq!(effects.primary, Some(AnomalyKind::OriginFailure));
        assert_eq!(AnomalyKind::from_str_opt("cache_purge"), Some(AnomalyKind::CachePurge));
        assert_eq!(AnomalyKind::from_str_opt("flood"), None);
    }
}
