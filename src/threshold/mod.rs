//! Threshold Engine - Adaptive approval bar for consensus scores
//!
//! The bar a consensus score must clear moves with volatility, the token's
//! recent trading record and the market regime. Two interchangeable
//! strategies are available, selected by `threshold.mode`:
//!
//! - `adaptive`: volatility + history + regime adjustments
//! - `legacy`: single volatility interpolation around the base
//!
//! Whatever the strategy computes, the result is clamped to
//! `[min_threshold, max_threshold]`.

mod strategies;

pub use strategies::{AdaptiveThreshold, LegacyThreshold};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::MarketCondition;

/// Which threshold formula to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    Adaptive,
    Legacy,
}

impl Default for ThresholdMode {
    fn default() -> Self {
        ThresholdMode::Adaptive
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    pub mode: ThresholdMode,
    pub base_threshold: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
    /// At or below: calm market, stricter bar
    pub volatility_low_bound: f64,
    /// At or above: turbulent market, looser bar
    pub volatility_high_bound: f64,
    /// Trailing window for per-token performance
    pub history_window_days: i64,
    /// Trades needed before history moves the bar
    pub history_min_trades: usize,
    /// Avg PnL% above which the bar is relaxed
    pub history_good_pnl_pct: f64,
    /// Avg PnL% below which the bar is tightened
    pub history_bad_pnl_pct: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            mode: ThresholdMode::Adaptive,
            base_threshold: 0.5,
            min_threshold: 0.25,
            max_threshold: 0.85,
            volatility_low_bound: 0.015,
            volatility_high_bound: 0.04,
            history_window_days: 7,
            history_min_trades: 3,
            history_good_pnl_pct: 2.0,
            history_bad_pnl_pct: -2.0,
        }
    }
}

impl ThresholdConfig {
    /// Clamp into `[min, max]`. NaN falls back to the base threshold.
    pub fn clamp(&self, value: f64) -> f64 {
        let value = if value.is_nan() { self.base_threshold } else { value };
        value.clamp(self.min_threshold, self.max_threshold)
    }
}

/// Trailing performance of one token
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalStats {
    pub trade_count: usize,
    pub avg_pnl_pct: f64,
}

impl HistoricalStats {
    pub fn from_pnls(pnls: &[f64]) -> Option<Self> {
        if pnls.is_empty() {
            return None;
        }
        Some(Self {
            trade_count: pnls.len(),
            avg_pnl_pct: pnls.iter().sum::<f64>() / pnls.len() as f64,
        })
    }
}

/// Inputs to a threshold computation
#[derive(Debug, Clone, Default)]
pub struct ThresholdContext {
    pub volatility: Option<f64>,
    pub token: Option<String>,
    pub market_condition: MarketCondition,
    pub history: Option<HistoricalStats>,
}

impl ThresholdContext {
    pub fn with_volatility(volatility: f64) -> Self {
        Self {
            volatility: Some(volatility),
            ..Default::default()
        }
    }
}

/// Each adjustment that went into a threshold, for operator logs
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdBreakdown {
    pub base: f64,
    pub volatility_adjustment: f64,
    pub history_adjustment: f64,
    pub condition_adjustment: f64,
    /// Before clamping
    pub raw: f64,
    pub threshold: f64,
}

/// A threshold formula
pub trait ThresholdStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute the threshold and its components. Implementations must not
    /// keep state between calls.
    fn compute(&self, config: &ThresholdConfig, ctx: &ThresholdContext) -> ThresholdBreakdown;
}

pub struct ThresholdEngine {
    config: ThresholdConfig,
    strategy: Box<dyn ThresholdStrategy>,
}

impl ThresholdEngine {
    pub fn new(config: ThresholdConfig) -> Self {
        let strategy: Box<dyn ThresholdStrategy> = match config.mode {
            ThresholdMode::Adaptive => Box::new(AdaptiveThreshold),
            ThresholdMode::Legacy => Box::new(LegacyThreshold),
        };
        Self { config, strategy }
    }

    /// Use a custom formula instead of the configured one
    pub fn with_strategy(config: ThresholdConfig, strategy: Box<dyn ThresholdStrategy>) -> Self {
        Self { config, strategy }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn compute_threshold(&self, ctx: &ThresholdContext) -> f64 {
        self.explain(ctx).threshold
    }

    pub fn explain(&self, ctx: &ThresholdContext) -> ThresholdBreakdown {
        let mut breakdown = self.strategy.compute(&self.config, ctx);
        // Clamp again in case a custom strategy forgot
        breakdown.threshold = self.config.clamp(breakdown.threshold);
        debug!(
            strategy = self.strategy.name(),
            token = ctx.token.as_deref().unwrap_or("-"),
            volatility = ?ctx.volatility,
            condition = %ctx.market_condition,
            vol_adj = breakdown.volatility_adjustment,
            hist_adj = breakdown.history_adjustment,
            cond_adj = breakdown.condition_adjustment,
            threshold = breakdown.threshold,
            "Threshold computed"
        );
        breakdown
    }
}

impl Default for ThresholdEngine {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}
