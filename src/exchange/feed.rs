//! Spot price polling for the paper exchange

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ExchangeGateway, PaperExchange};
use crate::persistence::{DecisionEvent, EventLog};
use crate::store::ConfigStore;

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn spot_price(&self, token: &str) -> Result<Option<f64>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerFeedSettings {
    pub base_url: String,
    /// Appended to the token to form the exchange symbol, e.g. "USDT"
    pub quote_suffix: String,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

/// `GET {base_url}/api/v3/ticker/price?symbol={TOKEN}{suffix}`
pub struct TickerPriceFeed {
    client: Client,
    base_url: String,
    quote_suffix: String,
}

impl TickerPriceFeed {
    pub fn new(settings: &TickerFeedSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build price feed HTTP client")?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            quote_suffix: settings.quote_suffix.clone(),
        })
    }
}

#[async_trait]
impl PriceFeed for TickerPriceFeed {
    async fn spot_price(&self, token: &str) -> Result<Option<f64>> {
        let symbol = format!("{}{}", token.to_uppercase(), self.quote_suffix);
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);

        let response = self.client.get(&url).send().await?;
        if response.status().as_u16() == 400 {
            // Unknown symbol
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("Ticker API error: {}", response.status()));
        }

        let json: Value = response.json().await?;
        Ok(match &json["price"] {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        })
    }
}

/// Feed active and held tokens into the paper exchange until shutdown.
/// Bracket exits are journaled as closed positions.
pub async fn run_price_poller(
    exchange: Arc<PaperExchange>,
    feed: Arc<dyn PriceFeed>,
    store: Arc<dyn ConfigStore>,
    events: Arc<dyn EventLog>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "Price poller started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("Price poller stopping");
                return;
            }
        }

        let mut tokens: BTreeSet<String> = match store.active_channels().await {
            Ok(channels) => channels.into_keys().collect(),
            Err(e) => {
                warn!(error = %e, "Could not read active channels for price polling");
                BTreeSet::new()
            }
        };
        if let Ok(positions) = exchange.open_positions().await {
            tokens.extend(positions.into_iter().map(|p| p.token));
        }

        for token in tokens {
            match feed.spot_price(&token).await {
                Ok(Some(price)) => {
                    debug!(token = %token, price, "Spot price");
                    for exit in exchange.update_price(&token, price) {
                        let event = DecisionEvent::PositionClosed {
                            token: exit.token,
                            side: exit.side,
                            entry_price: exit.entry_price,
                            exit_price: exit.exit_price,
                            pnl_pct: exit.pnl_pct,
                            pred_diff_pct: None,
                        };
                        if let Err(e) = events.record(&event).await {
                            warn!(error = %e, "Failed to journal bracket exit");
                        }
                    }
                }
                Ok(None) => debug!(token = %token, "No spot price"),
                Err(e) => warn!(token = %token, error = %e, "Spot price fetch failed"),
            }
        }
    }
}
