//! Threshold formulas

use super::{ThresholdBreakdown, ThresholdConfig, ThresholdContext, ThresholdStrategy};
use crate::types::MarketCondition;

/// Adjustment when volatility is at or below the low bound
const CALM_ADJUSTMENT: f64 = 0.25;
/// Adjustment when volatility is at or above the high bound
const TURBULENT_ADJUSTMENT: f64 = -0.15;
/// Legacy formula swings the base by this much in either direction
const LEGACY_SWING: f64 = 0.2;

const HISTORY_GOOD_ADJUSTMENT: f64 = -0.05;
const HISTORY_BAD_ADJUSTMENT: f64 = 0.10;

/// Volatility readings that cannot be compared are treated as missing
fn usable_volatility(volatility: Option<f64>) -> Option<f64> {
    volatility.filter(|v| v.is_finite())
}

/// Linear position of `volatility` between the bounds, 0.0 at low and 1.0 at high
fn interpolation_factor(config: &ThresholdConfig, volatility: f64) -> f64 {
    let span = config.volatility_high_bound - config.volatility_low_bound;
    if span <= 0.0 {
        return if volatility >= config.volatility_high_bound { 1.0 } else { 0.0 };
    }
    ((volatility - config.volatility_low_bound) / span).clamp(0.0, 1.0)
}

/// Volatility + history + regime
pub struct AdaptiveThreshold;

impl AdaptiveThreshold {
    fn volatility_adjustment(config: &ThresholdConfig, volatility: Option<f64>) -> f64 {
        let Some(vol) = usable_volatility(volatility) else {
            return 0.0;
        };
        if vol <= config.volatility_low_bound {
            CALM_ADJUSTMENT
        } else if vol >= config.volatility_high_bound {
            TURBULENT_ADJUSTMENT
        } else {
            let factor = interpolation_factor(config, vol);
            CALM_ADJUSTMENT - factor * (CALM_ADJUSTMENT - TURBULENT_ADJUSTMENT)
        }
    }

    fn history_adjustment(config: &ThresholdConfig, ctx: &ThresholdContext) -> f64 {
        if ctx.token.is_none() {
            return 0.0;
        }
        match ctx.history {
            Some(stats) if stats.trade_count >= config.history_min_trades => {
                if stats.avg_pnl_pct > config.history_good_pnl_pct {
                    HISTORY_GOOD_ADJUSTMENT
                } else if stats.avg_pnl_pct < config.history_bad_pnl_pct {
                    HISTORY_BAD_ADJUSTMENT
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    fn condition_adjustment(condition: MarketCondition) -> f64 {
        match condition {
            MarketCondition::HighVolatility => -0.10,
            MarketCondition::Normal => 0.0,
            MarketCondition::LowVolatility => 0.05,
            MarketCondition::Trending => -0.05,
            MarketCondition::Sideways => 0.03,
        }
    }
}

impl ThresholdStrategy for AdaptiveThreshold {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn compute(&self, config: &ThresholdConfig, ctx: &ThresholdContext) -> ThresholdBreakdown {
        let base = config.base_threshold;
        let volatility_adjustment = Self::volatility_adjustment(config, ctx.volatility);
        let history_adjustment = Self::history_adjustment(config, ctx);
        let condition_adjustment = Self::condition_adjustment(ctx.market_condition);

        let raw = base + volatility_adjustment + history_adjustment + condition_adjustment;

        ThresholdBreakdown {
            base,
            volatility_adjustment,
            history_adjustment,
            condition_adjustment,
            raw,
            threshold: config.clamp(raw),
        }
    }
}

/// Single-factor formula kept as a fallback: base ± 0.2 by volatility only
pub struct LegacyThreshold;

impl ThresholdStrategy for LegacyThreshold {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn compute(&self, config: &ThresholdConfig, ctx: &ThresholdContext) -> ThresholdBreakdown {
        let base = config.base_threshold;
        let volatility_adjustment = match usable_volatility(ctx.volatility) {
            None => 0.0,
            Some(vol) if vol <= config.volatility_low_bound => LEGACY_SWING,
            Some(vol) if vol >= config.volatility_high_bound => -LEGACY_SWING,
            Some(vol) => LEGACY_SWING - interpolation_factor(config, vol) * 2.0 * LEGACY_SWING,
        };
        let raw = base + volatility_adjustment;

        ThresholdBreakdown {
            base,
            volatility_adjustment,
            history_adjustment: 0.0,
            condition_adjustment: 0.0,
            raw,
            threshold: config.clamp(raw),
        }
    }
}
