//! Per-token decision states and cycle bookkeeping

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::freshness::FreshnessReason;
use crate::types::Direction;

/// Where a token is in its evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Idle,
    FetchPrediction,
    FreshnessCheck,
    ComputeDivergence,
    Candidate,
    Review,
    Consensus,
    Approved,
    Rejected,
    Hold,
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalState::Idle => "idle",
            SignalState::FetchPrediction => "fetch_prediction",
            SignalState::FreshnessCheck => "freshness_check",
            SignalState::ComputeDivergence => "compute_divergence",
            SignalState::Candidate => "candidate",
            SignalState::Review => "review",
            SignalState::Consensus => "consensus",
            SignalState::Approved => "approved",
            SignalState::Rejected => "rejected",
            SignalState::Hold => "hold",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum HoldReason {
    /// Retries exhausted
    FetchFailed,
    Stale(FreshnessReason),
    /// Exchange has no usable price for the token
    NoPrice,
    BelowEntryBand,
    HeuristicDisagrees,
    NoConsensusProvider,
    /// Approved, but the exchange refused the order
    OrderFailed,
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldReason::FetchFailed => write!(f, "fetch_failed"),
            HoldReason::Stale(r) => write!(f, "stale:{}", r),
            HoldReason::NoPrice => write!(f, "no_price"),
            HoldReason::BelowEntryBand => write!(f, "below_entry_band"),
            HoldReason::HeuristicDisagrees => write!(f, "heuristic_disagrees"),
            HoldReason::NoConsensusProvider => write!(f, "no_consensus_provider"),
            HoldReason::OrderFailed => write!(f, "order_failed"),
        }
    }
}

/// Result of evaluating one token
#[derive(Debug, Clone, PartialEq)]
pub enum TokenOutcome {
    /// Already holding a position; left to the position monitor
    SkippedOpenPosition,
    Hold(HoldReason),
    Emitted {
        order_id: String,
        direction: Direction,
        score: f64,
        threshold: f64,
    },
    Rejected {
        direction: Direction,
        score: f64,
        threshold: f64,
    },
}

impl TokenOutcome {
    pub fn is_rejection(&self) -> bool {
        matches!(self, TokenOutcome::Rejected { .. })
    }
}

/// What one engine cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// Whether decision logic ran (false in standby)
    pub ran: bool,
    pub commands_applied: usize,
    /// Evaluated tokens in evaluation order
    pub outcomes: Vec<(String, TokenOutcome)>,
    /// Tokens left unevaluated after a rejection ended the cycle
    pub skipped_after_rejection: Vec<String>,
}

impl CycleReport {
    pub fn outcome(&self, token: &str) -> Option<&TokenOutcome> {
        self.outcomes.iter().find(|(t, _)| t == token).map(|(_, o)| o)
    }

    pub fn emitted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TokenOutcome::Emitted { .. }))
            .count()
    }

    pub fn summary(&self) -> String {
        let holds = self
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TokenOutcome::Hold(_)))
            .count();
        let rejected = self.outcomes.iter().filter(|(_, o)| o.is_rejection()).count();
        format!(
            "cycle={} ran={} evaluated={} emitted={} rejected={} holds={} skipped={} commands={}",
            self.cycle,
            self.ran,
            self.outcomes.len(),
            self.emitted(),
            rejected,
            holds,
            self.skipped_after_rejection.len(),
            self.commands_applied
        )
    }
}

/// Running totals across cycles
#[derive(Debug, Default)]
pub struct EngineStats {
    cycles: AtomicU64,
    emitted: AtomicU64,
    rejected: AtomicU64,
    holds: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub cycles: u64,
    pub emitted: u64,
    pub rejected: u64,
    pub holds: u64,
}

impl EngineStats {
    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, outcome: &TokenOutcome) {
        let counter = match outcome {
            TokenOutcome::Emitted { .. } => &self.emitted,
            TokenOutcome::Rejected { .. } => &self.rejected,
            TokenOutcome::Hold(_) => &self.holds,
            TokenOutcome::SkippedOpenPosition => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            holds: self.holds.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_ignore_skips() {
        let stats = EngineStats::default();
        stats.record_cycle();
        stats.record(&TokenOutcome::Hold(HoldReason::BelowEntryBand));
        stats.record(&TokenOutcome::SkippedOpenPosition);
        stats.record(&TokenOutcome::Rejected {
            direction: Direction::Buy,
            score: 0.3,
            threshold: 0.5,
        });

        let snap = stats.snapshot();
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.holds, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.emitted, 0);
    }

    #[test]
    fn test_hold_reason_display() {
        assert_eq!(HoldReason::Stale(FreshnessReason::SlowApi).to_string(), "stale:slow_api");
    }
}
