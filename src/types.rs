//! Core types used throughout SignalGate
//!
//! Defines forecasts, reviewer opinions, signals, positions and orders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Trading direction proposed for a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Hold
    }
}

impl Direction {
    /// Candidate direction implied by a forecast divergence.
    pub fn from_diff(diff_pct: f64) -> Self {
        if diff_pct > 0.0 {
            Direction::Buy
        } else if diff_pct < 0.0 {
            Direction::Sell
        } else {
            Direction::Hold
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, Direction::Hold)
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "LONG" => Some(Direction::Buy),
            "SELL" | "SHORT" => Some(Direction::Sell),
            "HOLD" => Some(Direction::Hold),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
            Direction::Hold => write!(f, "HOLD"),
        }
    }
}

/// Side of an open position, derived from the sign of its size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// `None` for a flat (zero) size.
    pub fn from_size(size: f64) -> Option<Self> {
        if size > 0.0 {
            Some(PositionSide::Long)
        } else if size < 0.0 {
            Some(PositionSide::Short)
        } else {
            None
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Market regime used by the threshold table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketCondition {
    Normal,
    HighVolatility,
    LowVolatility,
    Trending,
    Sideways,
}

impl Default for MarketCondition {
    fn default() -> Self {
        MarketCondition::Normal
    }
}

impl MarketCondition {
    /// Classify a regime from volatility alone. Trending/Sideways need
    /// directional information and are never produced here.
    pub fn classify(volatility: Option<f64>, low_bound: f64, high_bound: f64) -> Self {
        match volatility {
            Some(v) if v >= high_bound => MarketCondition::HighVolatility,
            Some(v) if v <= low_bound => MarketCondition::LowVolatility,
            _ => MarketCondition::Normal,
        }
    }
}

impl fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketCondition::Normal => write!(f, "normal"),
            MarketCondition::HighVolatility => write!(f, "high_volatility"),
            MarketCondition::LowVolatility => write!(f, "low_volatility"),
            MarketCondition::Trending => write!(f, "trending"),
            MarketCondition::Sideways => write!(f, "sideways"),
        }
    }
}

/// Quality of the sources a research provider cited
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceQualityTier {
    None,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl SourceQualityTier {
    /// Score in [0, 1] blended into the provider's raw consensus score
    pub fn score(&self) -> f64 {
        match self {
            SourceQualityTier::None => 0.0,
            SourceQualityTier::Low => 0.25,
            SourceQualityTier::Medium => 0.5,
            SourceQualityTier::High => 0.75,
            SourceQualityTier::VeryHigh => 1.0,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(&['_', '-', ' '][..], "").as_str() {
            "none" => Some(SourceQualityTier::None),
            "low" => Some(SourceQualityTier::Low),
            "medium" => Some(SourceQualityTier::Medium),
            "high" => Some(SourceQualityTier::High),
            "veryhigh" => Some(SourceQualityTier::VeryHigh),
            _ => None,
        }
    }
}

impl fmt::Display for SourceQualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceQualityTier::None => write!(f, "none"),
            SourceQualityTier::Low => write!(f, "low"),
            SourceQualityTier::Medium => write!(f, "medium"),
            SourceQualityTier::High => write!(f, "high"),
            SourceQualityTier::VeryHigh => write!(f, "very_high"),
        }
    }
}

/// Raw forecast as received from the prediction source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSample {
    /// Forecast price
    pub value: f64,
    /// When the source produced the forecast
    pub observed_at: DateTime<Utc>,
    /// When we issued the request
    pub requested_at: DateTime<Utc>,
    /// Round-trip time of the request
    pub api_latency: Duration,
    /// Forecast stream identifier
    pub channel_id: String,
}

/// Extra evidence attached by research-capable reviewers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchMetadata {
    pub source_quality: Option<SourceQualityTier>,
    pub citation_count: Option<u32>,
}

/// One reviewer's verdict on a candidate trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOpinion {
    pub provider_id: String,
    pub approval: bool,
    /// 0 - 100
    pub confidence: f64,
    /// 1 (safe) - 10 (reckless)
    pub risk_score: f64,
    pub reasoning: String,
    /// Only set by research-capable providers
    pub research: Option<ResearchMetadata>,
}

impl ReviewOpinion {
    pub fn new(provider_id: impl Into<String>, approval: bool, confidence: f64, risk_score: f64) -> Self {
        Self {
            provider_id: provider_id.into(),
            approval,
            confidence: confidence.clamp(0.0, 100.0),
            risk_score: risk_score.clamp(1.0, 10.0),
            reasoning: String::new(),
            research: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_research(mut self, research: ResearchMetadata) -> Self {
        self.research = Some(research);
        self
    }
}

impl fmt::Display for ReviewOpinion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} conf={:.0} risk={:.0}",
            self.provider_id,
            if self.approval { "APPROVE" } else { "REJECT" },
            self.confidence,
            self.risk_score
        )
    }
}

/// What a reviewer is asked to judge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeContext {
    pub token: String,
    pub current_price: f64,
    pub predicted_price: f64,
    pub diff_pct: f64,
    pub direction: Direction,
    pub market_condition: MarketCondition,
    pub volatility: Option<f64>,
}

/// Divergence-derived signal for a token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub token: String,
    pub direction: Direction,
    pub current_price: f64,
    pub predicted_price: f64,
    /// Fractional divergence (0.02 = 2%)
    pub diff_pct: f64,
}

impl TradeSignal {
    /// Returns `None` when the current price cannot anchor a divergence.
    pub fn from_prices(token: &str, current_price: f64, predicted_price: f64) -> Option<Self> {
        if !(current_price.is_finite() && current_price > 0.0) || !predicted_price.is_finite() {
            return None;
        }
        let diff_pct = (predicted_price - current_price) / current_price;
        Some(Self {
            token: token.to_string(),
            direction: Direction::from_diff(diff_pct),
            current_price,
            predicted_price,
            diff_pct,
        })
    }
}

/// Open position as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token: String,
    pub entry_price: f64,
    /// Signed size: positive long, negative short
    pub current_size: f64,
}

impl Position {
    pub fn side(&self) -> Option<PositionSide> {
        PositionSide::from_size(self.current_size)
    }

    /// Unrealized PnL in percent at `current_price`.
    pub fn pnl_pct(&self, current_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let raw = (current_price - self.entry_price) / self.entry_price * 100.0;
        match self.side() {
            Some(PositionSide::Short) => -raw,
            _ => raw,
        }
    }
}

/// Bracket order emitted on approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: String,
    pub token: String,
    pub direction: Direction,
    /// Take-profit distance in percent
    pub profit_target_pct: f64,
    /// Stop-loss distance in percent
    pub stop_loss_pct: f64,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    /// Size a bracket from the forecast divergence: target = |diff| in percent,
    /// stop = half the target.
    pub fn from_signal(signal: &TradeSignal) -> Self {
        let profit_target_pct = signal.diff_pct.abs() * 100.0;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            token: signal.token.clone(),
            direction: signal.direction,
            profit_target_pct,
            stop_loss_pct: profit_target_pct * 0.5,
            created_at: Utc::now(),
        }
    }
}
