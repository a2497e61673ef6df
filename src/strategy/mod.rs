//! Heuristic Strategy - independent second opinion on the forecast direction
//!
//! A heuristic either votes for a direction or abstains. The engine forces a
//! hold when a vote disagrees with the forecast-implied direction.

use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::trace;

use crate::types::{Direction, TradeSignal};

pub trait HeuristicStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` abstains
    fn vote(&self, signal: &TradeSignal) -> Option<Direction>;
}

/// Never votes
pub struct Abstain;

impl HeuristicStrategy for Abstain {
    fn name(&self) -> &'static str {
        "abstain"
    }

    fn vote(&self, _signal: &TradeSignal) -> Option<Direction> {
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MomentumConfig {
    /// Observed prices averaged per token
    pub lookback: usize,
    /// Minimum fractional distance from the trailing mean to vote
    pub min_move_pct: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            lookback: 5,
            min_move_pct: 0.002,
        }
    }
}

/// Votes with the price's position relative to its trailing mean.
///
/// Every signal it sees is also recorded as an observation, so the window
/// fills as the engine cycles. Abstains until `lookback` prices are known or
/// while price sits within `min_move_pct` of the mean.
pub struct MomentumHeuristic {
    config: MomentumConfig,
    history: RwLock<HashMap<String, VecDeque<f64>>>,
}

impl MomentumHeuristic {
    pub fn new(config: MomentumConfig) -> Self {
        Self {
            config,
            history: RwLock::new(HashMap::new()),
        }
    }

    fn observe(&self, token: &str, price: f64) -> Option<f64> {
        let mut history = self.history.write().ok()?;
        let window = history.entry(token.to_string()).or_default();
        let lookback = self.config.lookback.max(1);

        let mean = if window.len() >= lookback {
            Some(window.iter().sum::<f64>() / window.len() as f64)
        } else {
            None
        };

        window.push_back(price);
        while window.len() > lookback {
            window.pop_front();
        }
        mean
    }
}

impl HeuristicStrategy for MomentumHeuristic {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn vote(&self, signal: &TradeSignal) -> Option<Direction> {
        let mean = self.observe(&signal.token, signal.current_price)?;
        if mean <= 0.0 {
            return None;
        }
        let momentum = (signal.current_price - mean) / mean;
        trace!(token = %signal.token, momentum, "Momentum heuristic");

        if momentum > self.config.min_move_pct {
            Some(Direction::Buy)
        } else if momentum < -self.config.min_move_pct {
            Some(Direction::Sell)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(cur: f64) -> TradeSignal {
        TradeSignal::from_prices("BTC", cur, cur * 1.02).unwrap()
    }

    #[test]
    fn test_abstain_never_votes() {
        assert_eq!(Abstain.vote(&signal(100.0)), None);
    }

    #[test]
    fn test_momentum_abstains_until_warm() {
        let h = MomentumHeuristic::new(MomentumConfig {
            lookback: 3,
            min_move_pct: 0.001,
        });
        assert_eq!(h.vote(&signal(100.0)), None);
        assert_eq!(h.vote(&signal(100.0)), None);
        assert_eq!(h.vote(&signal(100.0)), None);
        // Window of three 100s, now well above the mean
        assert_eq!(h.vote(&signal(103.0)), Some(Direction::Buy));
    }

    #[test]
    fn test_momentum_votes_down_and_ignores_noise() {
        let h = MomentumHeuristic::new(MomentumConfig {
            lookback: 2,
            min_move_pct: 0.01,
        });
        h.vote(&signal(100.0));
        h.vote(&signal(100.0));
        assert_eq!(h.vote(&signal(100.5)), None);
        assert_eq!(h.vote(&signal(95.0)), Some(Direction::Sell));
    }
}
