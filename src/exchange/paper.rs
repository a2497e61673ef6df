//! Paper Exchange
//!
//! Simulated execution against polled spot prices:
//! - fills at the latest price plus slippage
//! - take-profit and stop-loss legs checked on every price update
//! - volatility from the standard deviation of recent tick-to-tick returns

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::{info, warn};

use super::ExchangeGateway;
use crate::types::{Direction, OrderRequest, Position, PositionSide};

#[derive(Debug, Clone, Deserialize)]
pub struct PaperExchangeConfig {
    /// Quote-currency notional per order
    pub notional_per_trade: f64,
    /// Simulated slippage in basis points
    pub slippage_bps: f64,
    /// Price ticks kept per token
    pub history_len: usize,
    /// Ticks required before volatility is reported
    pub min_history: usize,
}

impl Default for PaperExchangeConfig {
    fn default() -> Self {
        Self {
            notional_per_trade: 100.0,
            slippage_bps: 5.0,
            history_len: 60,
            min_history: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperExitReason {
    TakeProfit,
    StopLoss,
    Manual,
}

impl std::fmt::Display for PaperExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaperExitReason::TakeProfit => write!(f, "take_profit"),
            PaperExitReason::StopLoss => write!(f, "stop_loss"),
            PaperExitReason::Manual => write!(f, "manual"),
        }
    }
}

/// A position the exchange closed
#[derive(Debug, Clone)]
pub struct PaperExit {
    pub token: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_pct: f64,
    pub reason: PaperExitReason,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    order_id: String,
    position: Position,
    take_profit_price: f64,
    stop_loss_price: f64,
    opened_at: DateTime<Utc>,
}

impl PaperPosition {
    fn bracket_hit(&self, price: f64) -> Option<PaperExitReason> {
        match self.position.side() {
            Some(PositionSide::Long) if price >= self.take_profit_price => Some(PaperExitReason::TakeProfit),
            Some(PositionSide::Long) if price <= self.stop_loss_price => Some(PaperExitReason::StopLoss),
            Some(PositionSide::Short) if price <= self.take_profit_price => Some(PaperExitReason::TakeProfit),
            Some(PositionSide::Short) if price >= self.stop_loss_price => Some(PaperExitReason::StopLoss),
            _ => None,
        }
    }
}

pub struct PaperExchange {
    config: PaperExchangeConfig,
    prices: RwLock<HashMap<String, VecDeque<f64>>>,
    positions: RwLock<HashMap<String, PaperPosition>>,
    closed: RwLock<Vec<PaperExit>>,
}

impl PaperExchange {
    pub fn new(config: PaperExchangeConfig) -> Self {
        Self {
            config,
            prices: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    /// Record a price tick and settle any bracket it crosses
    pub fn update_price(&self, token: &str, price: f64) -> Vec<PaperExit> {
        if !(price.is_finite() && price > 0.0) {
            return Vec::new();
        }

        if let Ok(mut prices) = self.prices.write() {
            let history = prices.entry(token.to_string()).or_default();
            history.push_back(price);
            while history.len() > self.config.history_len.max(2) {
                history.pop_front();
            }
        }

        let hit = self
            .positions
            .read()
            .ok()
            .and_then(|p| p.get(token).and_then(|pos| pos.bracket_hit(price)));

        match hit {
            Some(reason) => self.settle(token, price, reason).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn latest_price(&self, token: &str) -> Option<f64> {
        self.prices
            .read()
            .ok()
            .and_then(|p| p.get(token).and_then(|h| h.back().copied()))
    }

    fn settle(&self, token: &str, price: f64, reason: PaperExitReason) -> Option<PaperExit> {
        let pos = self.positions.write().ok()?.remove(token)?;
        let side = pos.position.side()?;
        let exit = PaperExit {
            token: token.to_string(),
            side,
            entry_price: pos.position.entry_price,
            exit_price: price,
            pnl_pct: pos.position.pnl_pct(price),
            reason,
        };
        info!(
            token,
            order_id = %pos.order_id,
            side = %side,
            entry = exit.entry_price,
            exit = price,
            pnl_pct = exit.pnl_pct,
            reason = %reason,
            held_secs = (Utc::now() - pos.opened_at).num_seconds(),
            "[PAPER] Position closed"
        );
        if let Ok(mut closed) = self.closed.write() {
            closed.push(exit.clone());
        }
        Some(exit)
    }

    /// Positions closed so far, oldest first
    pub fn closed_positions(&self) -> Vec<PaperExit> {
        self.closed.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn tracked_tokens(&self) -> Vec<String> {
        self.prices
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn sample_volatility(history: &VecDeque<f64>) -> f64 {
        let returns: Vec<f64> = history
            .iter()
            .zip(history.iter().skip(1))
            .filter(|(prev, _)| **prev > 0.0)
            .map(|(prev, next)| (next - prev) / prev)
            .collect();
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
        var.sqrt()
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn current_price(&self, token: &str) -> Result<Option<f64>> {
        Ok(self.latest_price(token))
    }

    async fn volatility(&self, token: &str) -> Result<Option<f64>> {
        let prices = self.prices.read().map_err(|_| anyhow!("price lock poisoned"))?;
        Ok(prices
            .get(token)
            .filter(|h| h.len() >= self.config.min_history.max(3))
            .map(Self::sample_volatility))
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        let positions = self.positions.read().map_err(|_| anyhow!("position lock poisoned"))?;
        Ok(positions.values().map(|p| p.position.clone()).collect())
    }

    async fn place_bracket_order(&self, order: &OrderRequest) -> Result<String> {
        let Some(price) = self.latest_price(&order.token) else {
            bail!("No price for {}", order.token);
        };
        let slip = price * self.config.slippage_bps / 10_000.0;
        let (fill, sign) = match order.direction {
            Direction::Buy => (price + slip, 1.0),
            Direction::Sell => (price - slip, -1.0),
            Direction::Hold => bail!("Cannot place a HOLD order for {}", order.token),
        };
        let size = sign * self.config.notional_per_trade / fill;
        let tp = order.profit_target_pct / 100.0;
        let sl = order.stop_loss_pct / 100.0;
        let (take_profit_price, stop_loss_price) = if sign > 0.0 {
            (fill * (1.0 + tp), fill * (1.0 - sl))
        } else {
            (fill * (1.0 - tp), fill * (1.0 + sl))
        };

        let mut positions = self.positions.write().map_err(|_| anyhow!("position lock poisoned"))?;
        if positions.contains_key(&order.token) {
            bail!("Position already open for {}", order.token);
        }
        positions.insert(
            order.token.clone(),
            PaperPosition {
                order_id: order.id.clone(),
                position: Position {
                    token: order.token.clone(),
                    entry_price: fill,
                    current_size: size,
                },
                take_profit_price,
                stop_loss_price,
                opened_at: Utc::now(),
            },
        );

        info!(
            token = %order.token,
            order_id = %order.id,
            direction = %order.direction,
            fill,
            size,
            take_profit = take_profit_price,
            stop_loss = stop_loss_price,
            "[PAPER] Bracket order filled"
        );
        Ok(order.id.clone())
    }

    async fn market_close(&self, token: &str) -> Result<bool> {
        let Some(price) = self.latest_price(token) else {
            bail!("No price to close {}", token);
        };
        if self.settle(token, price, PaperExitReason::Manual).is_none() {
            warn!(token, "[PAPER] Close requested with no open position");
            return Ok(false);
        }
        Ok(true)
    }
}
