//! Configuration management for SignalGate
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

use crate::consensus::ConsensusConfig;
use crate::engine::EngineConfig;
use crate::error::EngineError;
use crate::exchange::{PaperExchangeConfig, TickerFeedSettings};
use crate::freshness::FreshnessConfig;
use crate::monitor::MonitorConfig;
use crate::prediction::PredictionHttpSettings;
use crate::retry::RetrySettings;
use crate::review::LlmReviewSettings;
use crate::store::OperatingMode;
use crate::strategy::MomentumConfig;
use crate::threshold::ThresholdConfig;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub freshness: FreshnessConfig,
    pub threshold: ThresholdConfig,
    pub consensus: ConsensusConfig,
    pub retry: RetrySettings,
    pub monitor: MonitorConfig,
    pub heuristic: HeuristicConfig,
    pub prediction: PredictionHttpSettings,
    /// Review panel, in priority order
    #[serde(default)]
    pub providers: Vec<LlmReviewSettings>,
    pub paper: PaperExchangeConfig,
    pub price_feed: TickerFeedSettings,
    pub store: StoreConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Version tag for logs
    pub tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Used when RUST_LOG is unset
    pub default_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeuristicKind {
    Abstain,
    Momentum,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeuristicConfig {
    pub kind: HeuristicKind,
    pub momentum: MomentumConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Mode on first start; later starts use the state file
    pub initial_mode: OperatingMode,
    /// token -> forecast channel on first start
    pub channels: HashMap<String, String>,
    /// JSON mirror of operator changes
    #[serde(default)]
    pub state_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Write CSV event log and trade journal
    pub csv_enabled: bool,
}

impl AppConfig {
    /// Builder pre-loaded with every default
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let channels: HashMap<String, String> = HashMap::from([
            ("BTC".to_string(), "btc-usd".to_string()),
            ("ETH".to_string(), "eth-usd".to_string()),
        ]);

        let builder = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            // Logging defaults
            .set_default("logging.json", false)?
            .set_default("logging.default_filter", "info,signalgate=debug")?
            // Engine defaults
            .set_default("engine.cycle_interval_secs", 60)?
            .set_default("engine.config_poll_secs", 30)?
            .set_default("engine.entry_threshold", 0.01)?
            .set_default("engine.inter_token_delay_ms", 2000)?
            .set_default("engine.rejection_policy", "stop_cycle")?
            .set_default("engine.evaluation_mode", "sequential")?
            .set_default("engine.max_concurrent_tokens", 4)?
            .set_default("engine.review_timeout_secs", 30)?
            // Freshness defaults
            .set_default("freshness.max_age_secs", 30.0)?
            .set_default("freshness.max_api_latency_secs", 5.0)?
            .set_default("freshness.warn_age_secs", 20.0)?
            // Threshold defaults
            .set_default("threshold.mode", "adaptive")?
            .set_default("threshold.base_threshold", 0.5)?
            .set_default("threshold.min_threshold", 0.25)?
            .set_default("threshold.max_threshold", 0.85)?
            .set_default("threshold.volatility_low_bound", 0.015)?
            .set_default("threshold.volatility_high_bound", 0.04)?
            .set_default("threshold.history_window_days", 7)?
            .set_default("threshold.history_min_trades", 3)?
            .set_default("threshold.history_good_pnl_pct", 2.0)?
            .set_default("threshold.history_bad_pnl_pct", -2.0)?
            // Consensus defaults
            .set_default("consensus.high_volatility_cutoff", 0.03)?
            .set_default("consensus.news_impact_threshold", 0.5)?
            .set_default("consensus.quality_bonus_weight", 0.2)?
            // Retry defaults
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.backoff_ms", 2000)?
            // Monitor defaults
            .set_default("monitor.close_buffer", 0.01)?
            // Heuristic defaults
            .set_default("heuristic.kind", "abstain")?
            .set_default("heuristic.momentum.lookback", 5)?
            .set_default("heuristic.momentum.min_move_pct", 0.002)?
            // Prediction source defaults
            .set_default("prediction.base_url", "http://localhost:8080")?
            .set_default("prediction.api_key_env", "PREDICTION_API_KEY")?
            .set_default("prediction.timeout_secs", 5)?
            // Paper exchange defaults
            .set_default("paper.notional_per_trade", 100.0)?
            .set_default("paper.slippage_bps", 5.0)?
            .set_default("paper.history_len", 60)?
            .set_default("paper.min_history", 5)?
            .set_default("price_feed.base_url", "https://api.binance.com")?
            .set_default("price_feed.quote_suffix", "USDT")?
            .set_default("price_feed.poll_interval_secs", 10)?
            .set_default("price_feed.timeout_secs", 5)?
            // Store defaults
            .set_default("store.initial_mode", "standby")?
            .set_default("store.channels", channels)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?;

        Ok(builder)
    }

    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SIGNALGATE__*)
            .add_source(Environment::with_prefix("SIGNALGATE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Cross-field checks. Any failure refuses startup.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: String| Err(EngineError::Configuration(msg));

        if self.providers.is_empty() {
            return fail("at least one review provider must be configured".to_string());
        }
        let mut ids = HashSet::new();
        for p in &self.providers {
            if !ids.insert(p.id.as_str()) {
                return fail(format!("duplicate review provider id '{}'", p.id));
            }
        }

        let t = &self.threshold;
        if !(t.min_threshold <= t.base_threshold && t.base_threshold <= t.max_threshold) {
            return fail(format!(
                "threshold bounds out of order: min={} base={} max={}",
                t.min_threshold, t.base_threshold, t.max_threshold
            ));
        }
        if !(0.0..=1.0).contains(&t.min_threshold) || !(0.0..=1.0).contains(&t.max_threshold) {
            return fail("threshold bounds must lie in [0, 1]".to_string());
        }
        if t.volatility_low_bound >= t.volatility_high_bound {
            return fail(format!(
                "volatility_low_bound ({}) must be below volatility_high_bound ({})",
                t.volatility_low_bound, t.volatility_high_bound
            ));
        }

        let f = &self.freshness;
        if f.max_age_secs <= 0.0 || f.max_api_latency_secs <= 0.0 {
            return fail("freshness limits must be positive".to_string());
        }
        if f.warn_age_secs > f.max_age_secs {
            return fail("freshness.warn_age_secs exceeds max_age_secs".to_string());
        }

        if self.engine.entry_threshold <= 0.0 {
            return fail("engine.entry_threshold must be positive".to_string());
        }
        if self.engine.max_concurrent_tokens == 0 {
            return fail("engine.max_concurrent_tokens must be at least 1".to_string());
        }
        if self.monitor.close_buffer < 0.0 {
            return fail("monitor.close_buffer cannot be negative".to_string());
        }
        if !(0.0..=1.0).contains(&self.consensus.quality_bonus_weight) {
            return fail("consensus.quality_bonus_weight must lie in [0, 1]".to_string());
        }

        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        let providers: Vec<String> = self
            .providers
            .iter()
            .map(|p| format!("{}:{}", p.id, p.role))
            .collect();
        format!(
            "bot={} providers={:?} threshold={:?} base={:.2} entry={:.3} mode={:?} on_reject={:?} heuristic={:?} channels={}",
            self.bot.tag,
            providers,
            self.threshold.mode,
            self.threshold.base_threshold,
            self.engine.entry_threshold,
            self.engine.evaluation_mode,
            self.engine.rejection_policy,
            self.heuristic.kind,
            self.store.channels.len()
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
