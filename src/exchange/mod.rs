//! Exchange gateway - prices, positions and order routing

mod feed;
mod paper;

pub use feed::{run_price_poller, PriceFeed, TickerFeedSettings, TickerPriceFeed};
pub use paper::{PaperExchange, PaperExchangeConfig, PaperExit, PaperExitReason};

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{OrderRequest, Position};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// `None` when the exchange has no price for `token`
    async fn current_price(&self, token: &str) -> Result<Option<f64>>;

    /// Recent return volatility, `None` until enough history exists
    async fn volatility(&self, token: &str) -> Result<Option<f64>>;

    async fn open_positions(&self) -> Result<Vec<Position>>;

    /// Open a position with take-profit and stop-loss attached.
    /// Returns the exchange order id.
    async fn place_bracket_order(&self, order: &OrderRequest) -> Result<String>;

    /// Flatten the position in `token` at market.
    /// `Ok(false)` means there was nothing to close.
    async fn market_close(&self, token: &str) -> Result<bool>;
}
