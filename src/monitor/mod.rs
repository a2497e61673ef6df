//! Position Monitor - forecast-driven exits with a hysteresis buffer
//!
//! A long is closed once the forecast sits more than `close_buffer` below
//! the current price; a short once it sits more than `close_buffer` above.
//! Anything missing (channel, price, forecast) skips the position this round.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::exchange::ExchangeGateway;
use crate::persistence::{DecisionEvent, EventLog};
use crate::prediction::{fetch_with_retry, PredictionSource};
use crate::retry::RetryPolicy;
use crate::types::{Position, PositionSide};

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Fractional forecast divergence required to close (0.01 = 1%)
    pub close_buffer: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { close_buffer: 0.01 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorAction {
    Close,
    Hold,
}

/// Pure exit rule
pub fn decide(side: PositionSide, pred_diff_pct: f64, close_buffer: f64) -> MonitorAction {
    let close = match side {
        PositionSide::Long => pred_diff_pct < -close_buffer,
        PositionSide::Short => pred_diff_pct > close_buffer,
    };
    if close {
        MonitorAction::Close
    } else {
        MonitorAction::Hold
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionReview {
    pub token: String,
    pub side: PositionSide,
    pub current_price: f64,
    pub predicted_price: f64,
    pub pnl_pct: f64,
    pub pred_diff_pct: f64,
    pub action: MonitorAction,
    /// Whether a requested close went through
    pub closed: bool,
}

pub struct PositionMonitor {
    config: MonitorConfig,
    predictions: Arc<dyn PredictionSource>,
    exchange: Arc<dyn ExchangeGateway>,
    events: Arc<dyn EventLog>,
    retry: RetryPolicy,
}

impl PositionMonitor {
    pub fn new(
        config: MonitorConfig,
        predictions: Arc<dyn PredictionSource>,
        exchange: Arc<dyn ExchangeGateway>,
        events: Arc<dyn EventLog>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            predictions,
            exchange,
            events,
            retry,
        }
    }

    /// Review every open position. `channels` maps token -> forecast channel.
    pub async fn run_once(&self, channels: &HashMap<String, String>) -> Vec<PositionReview> {
        let positions = match self.exchange.open_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Cannot list open positions");
                return Vec::new();
            }
        };

        let mut reviews = Vec::new();
        for position in positions {
            let Some(channel) = channels.get(&position.token) else {
                debug!(token = %position.token, "No forecast channel for open position");
                continue;
            };
            if let Some(review) = self.evaluate(&position, channel).await {
                reviews.push(review);
            }
        }
        reviews
    }

    /// Review one position, closing it when the rule says so
    pub async fn evaluate(&self, position: &Position, channel: &str) -> Option<PositionReview> {
        let token = position.token.as_str();
        let side = position.side()?;

        let current_price = match self.exchange.current_price(token).await {
            Ok(Some(p)) if p > 0.0 => p,
            Ok(_) => {
                debug!(token, "No price, skipping position");
                return None;
            }
            Err(e) => {
                warn!(token, error = %e, "Price lookup failed, skipping position");
                return None;
            }
        };
        let sample = match fetch_with_retry(self.predictions.as_ref(), channel, &self.retry).await {
            Ok(s) => s,
            Err(e) => {
                warn!(token, error = %e, "Forecast unavailable, skipping position");
                return None;
            }
        };

        let pnl_pct = position.pnl_pct(current_price);
        let pred_diff_pct = (sample.value - current_price) / current_price;
        let action = decide(side, pred_diff_pct, self.config.close_buffer);

        let mut closed = false;
        match action {
            MonitorAction::Hold => {
                info!(
                    token,
                    side = %side,
                    entry = position.entry_price,
                    price = current_price,
                    pnl_pct,
                    pred_diff_pct,
                    "Position held"
                );
            }
            MonitorAction::Close => {
                info!(
                    token,
                    side = %side,
                    pnl_pct,
                    pred_diff_pct,
                    buffer = self.config.close_buffer,
                    "Forecast turned against position, closing"
                );
                match self.exchange.market_close(token).await {
                    Ok(false) => {
                        info!(token, "Position already flat, nothing to journal");
                    }
                    Ok(true) => {
                        closed = true;
                        let event = DecisionEvent::PositionClosed {
                            token: token.to_string(),
                            side,
                            entry_price: position.entry_price,
                            exit_price: current_price,
                            pnl_pct,
                            pred_diff_pct: Some(pred_diff_pct),
                        };
                        if let Err(e) = self.events.record(&event).await {
                            warn!(token, error = %e, "Close not journaled");
                        }
                    }
                    Err(e) => warn!(token, error = %e, "Market close failed"),
                }
            }
        }

        Some(PositionReview {
            token: token.to_string(),
            side,
            current_price,
            predicted_price: sample.value,
            pnl_pct,
            pred_diff_pct,
            action,
            closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeGateway;
    use crate::persistence::MemoryJournal;
    use crate::prediction::MockPredictionSource;
    use crate::types::PredictionSample;
    use chrono::Utc;
    use std::time::Duration;

    fn forecast(value: f64) -> PredictionSample {
        PredictionSample {
            value,
            observed_at: Utc::now(),
            requested_at: Utc::now(),
            api_latency: Duration::from_millis(50),
            channel_id: "btc".to_string(),
        }
    }

    fn long_btc() -> Position {
        Position {
            token: "BTC".to_string(),
            entry_price: 100.0,
            current_size: 1.0,
        }
    }

    #[test]
    fn test_decide_hysteresis() {
        assert_eq!(decide(PositionSide::Long, -0.019, 0.01), MonitorAction::Close);
        assert_eq!(decide(PositionSide::Long, -0.01, 0.01), MonitorAction::Hold);
        assert_eq!(decide(PositionSide::Long, 0.05, 0.01), MonitorAction::Hold);
        assert_eq!(decide(PositionSide::Short, 0.011, 0.01), MonitorAction::Close);
        assert_eq!(decide(PositionSide::Short, -0.05, 0.01), MonitorAction::Hold);
    }

    #[tokio::test]
    async fn test_long_closed_when_forecast_drops_below_buffer() {
        let mut exchange = MockExchangeGateway::new();
        exchange.expect_current_price().returning(|_| Ok(Some(105.0)));
        exchange.expect_market_close().times(1).returning(|_| Ok(true));
        let mut predictions = MockPredictionSource::new();
        predictions.expect_fetch().returning(|_| Ok(forecast(103.0)));
        let journal = Arc::new(MemoryJournal::new());

        let monitor = PositionMonitor::new(
            MonitorConfig::default(),
            Arc::new(predictions),
            Arc::new(exchange),
            journal.clone(),
            RetryPolicy::immediate(1),
        );

        let review = monitor.evaluate(&long_btc(), "btc").await.unwrap();
        assert!((review.pred_diff_pct - (103.0 - 105.0) / 105.0).abs() < 1e-12);
        assert!((review.pnl_pct - 5.0).abs() < 1e-9);
        assert_eq!(review.action, MonitorAction::Close);
        assert!(review.closed);
        assert_eq!(journal.count("position_closed"), 1);
    }

    #[tokio::test]
    async fn test_close_of_already_flat_position_is_not_journaled() {
        let mut exchange = MockExchangeGateway::new();
        exchange.expect_current_price().returning(|_| Ok(Some(105.0)));
        exchange.expect_market_close().times(1).returning(|_| Ok(false));
        let mut predictions = MockPredictionSource::new();
        predictions.expect_fetch().returning(|_| Ok(forecast(103.0)));
        let journal = Arc::new(MemoryJournal::new());

        let monitor = PositionMonitor::new(
            MonitorConfig::default(),
            Arc::new(predictions),
            Arc::new(exchange),
            journal.clone(),
            RetryPolicy::immediate(1),
        );

        let review = monitor.evaluate(&long_btc(), "btc").await.unwrap();
        assert_eq!(review.action, MonitorAction::Close);
        assert!(!review.closed);
        assert_eq!(journal.count("position_closed"), 0);
    }

    #[tokio::test]
    async fn test_missing_forecast_skips_without_closing() {
        let mut exchange = MockExchangeGateway::new();
        exchange.expect_current_price().returning(|_| Ok(Some(105.0)));
        exchange.expect_market_close().never();
        let mut predictions = MockPredictionSource::new();
        predictions
            .expect_fetch()
            .returning(|_| Err(anyhow::anyhow!("timeout")));

        let monitor = PositionMonitor::new(
            MonitorConfig::default(),
            Arc::new(predictions),
            Arc::new(exchange),
            Arc::new(MemoryJournal::new()),
            RetryPolicy::immediate(2),
        );

        assert!(monitor.evaluate(&long_btc(), "btc").await.is_none());
    }

    #[tokio::test]
    async fn test_run_once_skips_positions_without_channel() {
        let mut exchange = MockExchangeGateway::new();
        exchange.expect_open_positions().returning(|| Ok(vec![long_btc()]));
        exchange.expect_current_price().never();
        let predictions = MockPredictionSource::new();

        let monitor = PositionMonitor::new(
            MonitorConfig::default(),
            Arc::new(predictions),
            Arc::new(exchange),
            Arc::new(MemoryJournal::new()),
            RetryPolicy::immediate(1),
        );

        assert!(monitor.run_once(&HashMap::new()).await.is_empty());
    }
}
