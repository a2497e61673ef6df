//! Freshness Gate - Forecast age and latency validation
//!
//! Rejects forecasts that are too old or that arrived too slowly to still be
//! actionable, and scores the ones it lets through.
//!
//! Both limits are exclusive: a forecast exactly `max_age_secs` old passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::types::PredictionSample;

/// Weight of the age component in the freshness score
const AGE_SCORE_WEIGHT: f64 = 0.7;
/// Weight of the latency component in the freshness score
const LATENCY_SCORE_WEIGHT: f64 = 0.3;
/// Fraction of the latency budget above which an accepted sample is flagged
const LATENCY_WARN_RATIO: f64 = 0.7;

#[derive(Debug, Clone, Deserialize)]
pub struct FreshnessConfig {
    /// Oldest acceptable forecast in seconds
    pub max_age_secs: f64,
    /// Slowest acceptable API round trip in seconds
    pub max_api_latency_secs: f64,
    /// Age above which an accepted forecast is flagged
    pub warn_age_secs: f64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 30.0,
            max_api_latency_secs: 5.0,
            warn_age_secs: 20.0,
        }
    }
}

/// Why a sample was accepted or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreshnessReason {
    Fresh,
    StaleAge,
    SlowApi,
}

impl fmt::Display for FreshnessReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreshnessReason::Fresh => write!(f, "fresh"),
            FreshnessReason::StaleAge => write!(f, "stale_age"),
            FreshnessReason::SlowApi => write!(f, "slow_api"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessVerdict {
    pub accepted: bool,
    pub reason: FreshnessReason,
    pub age_seconds: f64,
    pub latency_seconds: f64,
    pub warning: bool,
    /// 0.0 - 1.0
    pub freshness_score: f64,
}

/// Monitoring counters; never read by the decision path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FreshnessStats {
    pub total_checked: u64,
    pub rejected_by_age: u64,
    pub rejected_by_latency: u64,
    pub warnings_issued: u64,
}

impl FreshnessStats {
    pub fn rejection_rate(&self) -> f64 {
        if self.total_checked == 0 {
            0.0
        } else {
            (self.rejected_by_age + self.rejected_by_latency) as f64 / self.total_checked as f64
        }
    }
}

pub struct FreshnessGate {
    config: FreshnessConfig,
    total_checked: AtomicU64,
    rejected_by_age: AtomicU64,
    rejected_by_latency: AtomicU64,
    warnings_issued: AtomicU64,
}

impl FreshnessGate {
    pub fn new(config: FreshnessConfig) -> Self {
        Self {
            config,
            total_checked: AtomicU64::new(0),
            rejected_by_age: AtomicU64::new(0),
            rejected_by_latency: AtomicU64::new(0),
            warnings_issued: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FreshnessConfig {
        &self.config
    }

    /// Evaluate a sample against the wall clock
    pub fn evaluate(&self, sample: &PredictionSample) -> FreshnessVerdict {
        self.evaluate_at(sample, Utc::now())
    }

    /// Evaluate a sample as of `now`
    pub fn evaluate_at(&self, sample: &PredictionSample, now: DateTime<Utc>) -> FreshnessVerdict {
        self.total_checked.fetch_add(1, Ordering::Relaxed);

        let age_seconds = Self::age_seconds(sample.observed_at, now);
        let latency_seconds = sample.api_latency.as_secs_f64();
        let freshness_score = self.score(age_seconds, latency_seconds);

        if age_seconds > self.config.max_age_secs {
            self.rejected_by_age.fetch_add(1, Ordering::Relaxed);
            warn!(
                channel = %sample.channel_id,
                age_secs = age_seconds,
                max_age_secs = self.config.max_age_secs,
                "Forecast rejected: too old"
            );
            return FreshnessVerdict {
                accepted: false,
                reason: FreshnessReason::StaleAge,
                age_seconds,
                latency_seconds,
                warning: false,
                freshness_score,
            };
        }

        if latency_seconds > self.config.max_api_latency_secs {
            self.rejected_by_latency.fetch_add(1, Ordering::Relaxed);
            warn!(
                channel = %sample.channel_id,
                latency_secs = latency_seconds,
                max_latency_secs = self.config.max_api_latency_secs,
                "Forecast rejected: API too slow"
            );
            return FreshnessVerdict {
                accepted: false,
                reason: FreshnessReason::SlowApi,
                age_seconds,
                latency_seconds,
                warning: false,
                freshness_score,
            };
        }

        let warning = age_seconds > self.config.warn_age_secs
            || latency_seconds > LATENCY_WARN_RATIO * self.config.max_api_latency_secs;
        if warning {
            self.warnings_issued.fetch_add(1, Ordering::Relaxed);
            debug!(
                channel = %sample.channel_id,
                age_secs = age_seconds,
                latency_secs = latency_seconds,
                "Forecast accepted near freshness limits"
            );
        }

        FreshnessVerdict {
            accepted: true,
            reason: FreshnessReason::Fresh,
            age_seconds,
            latency_seconds,
            warning,
            freshness_score,
        }
    }

    pub fn stats(&self) -> FreshnessStats {
        FreshnessStats {
            total_checked: self.total_checked.load(Ordering::Relaxed),
            rejected_by_age: self.rejected_by_age.load(Ordering::Relaxed),
            rejected_by_latency: self.rejected_by_latency.load(Ordering::Relaxed),
            warnings_issued: self.warnings_issued.load(Ordering::Relaxed),
        }
    }

    /// Age in seconds with microsecond precision; future timestamps count as 0.
    fn age_seconds(observed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let elapsed = now - observed_at;
        let micros = elapsed.num_microseconds().unwrap_or(i64::MAX);
        (micros as f64 / 1_000_000.0).max(0.0)
    }

    fn score(&self, age_seconds: f64, latency_seconds: f64) -> f64 {
        let age_component = if self.config.max_age_secs > 0.0 {
            (1.0 - age_seconds / self.config.max_age_secs).max(0.0)
        } else {
            0.0
        };
        let latency_component = if self.config.max_api_latency_secs > 0.0 {
            (1.0 - latency_seconds / self.config.max_api_latency_secs).max(0.0)
        } else {
            0.0
        };
        (AGE_SCORE_WEIGHT * age_component + LATENCY_SCORE_WEIGHT * latency_component).clamp(0.0, 1.0)
    }
}

impl Default for FreshnessGate {
    fn default() -> Self {
        Self::new(FreshnessConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_at(now: DateTime<Utc>, age_ms: i64, latency_ms: u64) -> PredictionSample {
        PredictionSample {
            value: 100.0,
            observed_at: now - chrono::Duration::milliseconds(age_ms),
            requested_at: now,
            api_latency: Duration::from_millis(latency_ms),
            channel_id: "btc-forecast".to_string(),
        }
    }

    #[test]
    fn test_fresh_sample_is_accepted() {
        let gate = FreshnessGate::default();
        let now = Utc::now();
        let verdict = gate.evaluate_at(&sample_at(now, 10_000, 1_000), now);

        assert!(verdict.accepted);
        assert_eq!(verdict.reason, FreshnessReason::Fresh);
        assert!(!verdict.warning);
        // 0.7 * (1 - 10/30) + 0.3 * (1 - 1/5)
        assert!((verdict.freshness_score - 0.706_666).abs() < 1e-4);
    }

    #[test]
    fn test_old_sample_is_rejected_for_age() {
        let gate = FreshnessGate::default();
        let now = Utc::now();
        let verdict = gate.evaluate_at(&sample_at(now, 35_000, 1_000), now);

        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, FreshnessReason::StaleAge);
    }

    #[test]
    fn test_age_boundary_is_exclusive() {
        let gate = FreshnessGate::default();
        let now = Utc::now();

        let at_limit = gate.evaluate_at(&sample_at(now, 30_000, 0), now);
        assert!(at_limit.accepted);

        let just_over = gate.evaluate_at(&sample_at(now, 30_001, 0), now);
        assert!(!just_over.accepted);
        assert_eq!(just_over.reason, FreshnessReason::StaleAge);
    }

    #[test]
    fn test_slow_api_is_rejected_only_after_age_passes() {
        let gate = FreshnessGate::default();
        let now = Utc::now();

        let slow = gate.evaluate_at(&sample_at(now, 1_000, 6_000), now);
        assert!(!slow.accepted);
        assert_eq!(slow.reason, FreshnessReason::SlowApi);

        // Both limits broken: age wins
        let both = gate.evaluate_at(&sample_at(now, 40_000, 6_000), now);
        assert_eq!(both.reason, FreshnessReason::StaleAge);

        let at_limit = gate.evaluate_at(&sample_at(now, 1_000, 5_000), now);
        assert!(at_limit.accepted);
    }

    #[test]
    fn test_warning_on_age_or_latency() {
        let gate = FreshnessGate::default();
        let now = Utc::now();

        let old_ish = gate.evaluate_at(&sample_at(now, 25_000, 100), now);
        assert!(old_ish.accepted && old_ish.warning);

        let slow_ish = gate.evaluate_at(&sample_at(now, 1_000, 3_600), now);
        assert!(slow_ish.accepted && slow_ish.warning);
    }

    #[test]
    fn test_future_timestamp_counts_as_zero_age() {
        let gate = FreshnessGate::default();
        let now = Utc::now();
        let verdict = gate.evaluate_at(&sample_at(now, -5_000, 0), now);

        assert!(verdict.accepted);
        assert_eq!(verdict.age_seconds, 0.0);
        assert!((verdict.freshness_score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let gate = FreshnessGate::default();
        let now = Utc::now();
        for age_ms in [0, 5_000, 29_999, 60_000, 600_000] {
            for latency_ms in [0, 2_000, 10_000] {
                let v = gate.evaluate_at(&sample_at(now, age_ms, latency_ms), now);
                assert!((0.0..=1.0).contains(&v.freshness_score));
            }
        }
    }

    #[test]
    fn test_stats_track_outcomes() {
        let gate = FreshnessGate::default();
        let now = Utc::now();
        gate.evaluate_at(&sample_at(now, 1_000, 100), now);
        gate.evaluate_at(&sample_at(now, 45_000, 100), now);
        gate.evaluate_at(&sample_at(now, 1_000, 9_000), now);
        gate.evaluate_at(&sample_at(now, 22_000, 100), now);

        let stats = gate.stats();
        assert_eq!(stats.total_checked, 4);
        assert_eq!(stats.rejected_by_age, 1);
        assert_eq!(stats.rejected_by_latency, 1);
        assert_eq!(stats.warnings_issued, 1);
        assert!((stats.rejection_rate() - 0.5).abs() < 1e-12);
    }
}
