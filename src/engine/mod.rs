//! Signal Engine - forecast to order, one token at a time
//!
//! For every active token without an open position:
//! fetch forecast -> freshness gate -> divergence vs. entry band ->
//! heuristic cross-check -> reviewer panel -> consensus vs. adaptive
//! threshold -> bracket order.
//!
//! Every exit from that pipeline is recorded as a `DecisionEvent`. Event log
//! failures are logged and never change the decision.

mod scheduler;
mod state;

pub use scheduler::Scheduler;
pub use state::{CycleReport, EngineStats, EngineStatsSnapshot, HoldReason, SignalState, TokenOutcome};

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::consensus::{ConsensusConfig, ConsensusContext, ConsensusValidator, MarketEvents};
use crate::error::EngineError;
use crate::exchange::ExchangeGateway;
use crate::freshness::FreshnessGate;
use crate::persistence::{DecisionEvent, EventLog, PerformanceHistory};
use crate::prediction::{fetch_with_retry, PredictionSource};
use crate::retry::RetryPolicy;
use crate::review::{ReviewPanel, ReviewProvider};
use crate::store::{ConfigStore, OperatingMode, OperatorCommand};
use crate::strategy::HeuristicStrategy;
use crate::threshold::{ThresholdContext, ThresholdEngine};
use crate::types::{MarketCondition, OrderRequest, ReviewOpinion, TradeContext, TradeSignal};

/// What happens to the rest of the cycle after a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Remaining tokens wait for the next cycle
    StopCycle,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// One token at a time, pausing after each hold
    Sequential,
    /// Tokens evaluated in parallel, bounded by `max_concurrent_tokens`
    Concurrent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub cycle_interval_secs: u64,
    /// How often channels and mode are re-read from the store
    pub config_poll_secs: u64,
    /// Minimum |forecast divergence| (fraction) to consider a trade
    pub entry_threshold: f64,
    pub inter_token_delay_ms: u64,
    pub rejection_policy: RejectionPolicy,
    pub evaluation_mode: EvaluationMode,
    pub max_concurrent_tokens: usize,
    pub review_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            config_poll_secs: 30,
            entry_threshold: 0.01,
            inter_token_delay_ms: 2_000,
            rejection_policy: RejectionPolicy::StopCycle,
            evaluation_mode: EvaluationMode::Sequential,
            max_concurrent_tokens: 4,
            review_timeout_secs: 30,
        }
    }
}

/// Optional news signal used to re-rank reviewers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketEventFeed: Send + Sync {
    async fn market_events(&self, token: &str) -> anyhow::Result<Option<MarketEvents>>;
}

/// External collaborators the engine drives
pub struct EngineParts {
    pub predictions: Arc<dyn PredictionSource>,
    pub exchange: Arc<dyn ExchangeGateway>,
    pub store: Arc<dyn ConfigStore>,
    pub events: Arc<dyn EventLog>,
    pub history: Arc<dyn PerformanceHistory>,
    pub heuristic: Arc<dyn HeuristicStrategy>,
    pub reviewers: Vec<Arc<dyn ReviewProvider>>,
    pub market_events: Option<Arc<dyn MarketEventFeed>>,
}

#[derive(Debug, Clone, Default)]
struct ConfigSnapshot {
    channels: HashMap<String, String>,
    mode: OperatingMode,
    refreshed_at: Option<Instant>,
}

pub struct SignalEngine {
    config: EngineConfig,
    gate: FreshnessGate,
    thresholds: ThresholdEngine,
    consensus: ConsensusValidator,
    panel: ReviewPanel,
    retry: RetryPolicy,
    predictions: Arc<dyn PredictionSource>,
    exchange: Arc<dyn ExchangeGateway>,
    store: Arc<dyn ConfigStore>,
    events: Arc<dyn EventLog>,
    history: Arc<dyn PerformanceHistory>,
    heuristic: Arc<dyn HeuristicStrategy>,
    market_events: Option<Arc<dyn MarketEventFeed>>,
    snapshot: RwLock<ConfigSnapshot>,
    cycle: AtomicU64,
    stats: EngineStats,
}

impl SignalEngine {
    /// Fails when no reviewer is configured.
    pub fn new(
        config: EngineConfig,
        gate: FreshnessGate,
        thresholds: ThresholdEngine,
        consensus: ConsensusConfig,
        retry: RetryPolicy,
        parts: EngineParts,
    ) -> Result<Self, EngineError> {
        let panel = ReviewPanel::new(parts.reviewers, Duration::from_secs(config.review_timeout_secs))?;
        let consensus = ConsensusValidator::new(consensus, panel.profiles())?;

        info!(
            reviewers = panel.len(),
            threshold_strategy = thresholds.strategy_name(),
            heuristic = parts.heuristic.name(),
            mode = ?config.evaluation_mode,
            rejection_policy = ?config.rejection_policy,
            "Signal engine ready"
        );

        Ok(Self {
            config,
            gate,
            thresholds,
            consensus,
            panel,
            retry,
            predictions: parts.predictions,
            exchange: parts.exchange,
            store: parts.store,
            events: parts.events,
            history: parts.history,
            heuristic: parts.heuristic,
            market_events: parts.market_events,
            snapshot: RwLock::new(ConfigSnapshot::default()),
            cycle: AtomicU64::new(0),
            stats: EngineStats::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn freshness_gate(&self) -> &FreshnessGate {
        &self.gate
    }

    /// Channels as of the last store refresh
    pub async fn active_channels(&self) -> HashMap<String, String> {
        self.snapshot.read().await.channels.clone()
    }

    pub async fn operating_mode(&self) -> OperatingMode {
        self.snapshot.read().await.mode
    }

    /// Re-read channels and mode from the store when the poll interval has
    /// elapsed (or `force`). A failed read keeps the previous snapshot.
    pub async fn refresh_config(&self, force: bool) {
        let poll = Duration::from_secs(self.config.config_poll_secs);
        let due = {
            let snap = self.snapshot.read().await;
            force || snap.refreshed_at.map(|t| t.elapsed() >= poll).unwrap_or(true)
        };
        if !due {
            return;
        }

        let channels = match self.store.active_channels().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Config store unavailable, keeping previous channels");
                return;
            }
        };
        let mode = match self.store.operating_mode().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Config store unavailable, keeping previous mode");
                return;
            }
        };

        let mut snap = self.snapshot.write().await;
        if snap.mode != mode {
            info!(from = %snap.mode, to = %mode, "Operating mode changed");
        }
        snap.channels = channels;
        snap.mode = mode;
        snap.refreshed_at = Some(Instant::now());
    }

    /// Drain and apply operator commands. Returns how many were applied.
    pub async fn apply_commands(&self) -> usize {
        let commands = match self.store.drain_pending_commands().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Could not drain operator commands");
                return 0;
            }
        };

        let mut applied = 0;
        for command in commands {
            info!(command = ?command, "Applying operator command");
            let result = match &command {
                OperatorCommand::SetMode { mode } => self.store.set_operating_mode(*mode).await,
                OperatorCommand::Activate { token, channel } => self.store.activate(token, channel).await,
                OperatorCommand::Deactivate { token } => self.store.deactivate(token).await,
                OperatorCommand::ClosePosition { token } => self.close_on_request(token).await,
            };
            match result {
                Ok(()) => applied += 1,
                Err(e) => error!(command = ?command, error = %e, "Operator command failed"),
            }
        }
        applied
    }

    async fn close_on_request(&self, token: &str) -> anyhow::Result<()> {
        let position = self
            .exchange
            .open_positions()
            .await?
            .into_iter()
            .find(|p| p.token == token);
        let Some(position) = position else {
            warn!(token, "Close requested but no position is open");
            return Ok(());
        };
        let Some(side) = position.side() else {
            return Ok(());
        };
        let price = self.exchange.current_price(token).await?.unwrap_or(position.entry_price);

        if !self.exchange.market_close(token).await? {
            return Ok(());
        }
        self.record(DecisionEvent::PositionClosed {
            token: token.to_string(),
            side,
            entry_price: position.entry_price,
            exit_price: price,
            pnl_pct: position.pnl_pct(price),
            pred_diff_pct: None,
        })
        .await;
        Ok(())
    }

    /// One pass over every active token
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.record_cycle();

        let commands_applied = self.apply_commands().await;
        self.refresh_config(commands_applied > 0).await;

        let mut report = CycleReport {
            cycle,
            commands_applied,
            ..Default::default()
        };

        let (channels, mode) = {
            let snap = self.snapshot.read().await;
            (snap.channels.clone(), snap.mode)
        };
        if mode == OperatingMode::Standby {
            debug!(cycle, "Standby, decision logic paused");
            return report;
        }
        report.ran = true;

        let open: HashSet<String> = match self.exchange.open_positions().await {
            Ok(positions) => positions.into_iter().map(|p| p.token).collect(),
            Err(e) => {
                error!(cycle, error = %e, "Cannot read open positions, skipping cycle");
                return report;
            }
        };

        let tokens: BTreeMap<String, String> = channels.into_iter().collect();
        match self.config.evaluation_mode {
            EvaluationMode::Sequential => self.run_sequential(tokens, &open, &mut report).await,
            EvaluationMode::Concurrent => self.run_concurrent(tokens, open, &mut report).await,
        }

        for (_, outcome) in &report.outcomes {
            self.stats.record(outcome);
        }
        info!("{}", report.summary());
        report
    }

    async fn run_sequential(
        &self,
        tokens: BTreeMap<String, String>,
        open: &HashSet<String>,
        report: &mut CycleReport,
    ) {
        let delay = Duration::from_millis(self.config.inter_token_delay_ms);
        let mut remaining = tokens.into_iter();

        while let Some((token, channel)) = remaining.next() {
            let outcome = self.evaluate_token(&token, &channel, open).await;
            let rejected = outcome.is_rejection();
            let held = matches!(outcome, TokenOutcome::Hold(_));
            report.outcomes.push((token, outcome));

            if rejected && self.config.rejection_policy == RejectionPolicy::StopCycle {
                report.skipped_after_rejection = remaining.by_ref().map(|(t, _)| t).collect();
                if !report.skipped_after_rejection.is_empty() {
                    info!(
                        skipped = ?report.skipped_after_rejection,
                        "Rejection ends this cycle"
                    );
                }
                break;
            }
            if held && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn run_concurrent(
        self: &Arc<Self>,
        tokens: BTreeMap<String, String>,
        open: HashSet<String>,
        report: &mut CycleReport,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tokens.max(1)));
        let open = Arc::new(open);
        let mut tasks = Vec::new();

        for (token, channel) in tokens {
            let engine = Arc::clone(self);
            let semaphore = semaphore.clone();
            let open = open.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let outcome = engine.evaluate_token(&token, &channel, &open).await;
                (token, outcome)
            }));
        }

        for task in tasks {
            match task.await {
                Ok(pair) => report.outcomes.push(pair),
                Err(e) => error!(error = %e, "Token evaluation task failed"),
            }
        }
    }

    /// Run one token through the decision pipeline
    pub async fn evaluate_token(&self, token: &str, channel: &str, open: &HashSet<String>) -> TokenOutcome {
        if open.contains(token) {
            trace!(token, "Open position, left to monitor");
            return TokenOutcome::SkippedOpenPosition;
        }

        let outcome = self.decide(token, channel).await;
        if let TokenOutcome::Hold(reason) = &outcome {
            if !matches!(reason, HoldReason::Stale(_)) {
                self.record(DecisionEvent::Hold {
                    token: token.to_string(),
                    reason: *reason,
                })
                .await;
            }
        }
        outcome
    }

    async fn decide(&self, token: &str, channel: &str) -> TokenOutcome {
        trace!(token, state = %SignalState::FetchPrediction);
        let sample = match fetch_with_retry(self.predictions.as_ref(), channel, &self.retry).await {
            Ok(s) => s,
            Err(e) => {
                warn!(token, error = %e, "Forecast unavailable, holding");
                return self.hold(token, HoldReason::FetchFailed);
            }
        };

        trace!(token, state = %SignalState::FreshnessCheck);
        let verdict = self.gate.evaluate(&sample);
        if !verdict.accepted {
            let err = EngineError::StaleData {
                token: token.to_string(),
                reason: verdict.reason,
            };
            info!(token, age_secs = verdict.age_seconds, latency_secs = verdict.latency_seconds, "{}", err);
            self.record(DecisionEvent::FreshnessRejected {
                token: token.to_string(),
                channel: channel.to_string(),
                reason: verdict.reason,
                age_seconds: verdict.age_seconds,
                latency_seconds: verdict.latency_seconds,
            })
            .await;
            return self.hold(token, HoldReason::Stale(verdict.reason));
        }

        trace!(token, state = %SignalState::ComputeDivergence);
        let current_price = match self.exchange.current_price(token).await {
            Ok(Some(p)) => p,
            Ok(None) => return self.hold(token, HoldReason::NoPrice),
            Err(e) => {
                let err = EngineError::Exchange(format!("{:#}", e));
                warn!(token, error = %err, "Price lookup failed");
                return self.hold(token, HoldReason::NoPrice);
            }
        };
        let Some(signal) = TradeSignal::from_prices(token, current_price, sample.value) else {
            return self.hold(token, HoldReason::NoPrice);
        };
        if signal.diff_pct.abs() < self.config.entry_threshold {
            debug!(token, diff_pct = signal.diff_pct, band = self.config.entry_threshold, "Divergence inside entry band");
            return self.hold(token, HoldReason::BelowEntryBand);
        }

        trace!(token, state = %SignalState::Candidate, direction = %signal.direction);
        if let Some(vote) = self.heuristic.vote(&signal) {
            if vote != signal.direction {
                info!(
                    token,
                    candidate = %signal.direction,
                    heuristic = %vote,
                    strategy = self.heuristic.name(),
                    "Heuristic disagrees, holding"
                );
                return self.hold(token, HoldReason::HeuristicDisagrees);
            }
        }

        trace!(token, state = %SignalState::Review);
        let volatility = match self.exchange.volatility(token).await {
            Ok(v) => v.filter(|v| v.is_finite()),
            Err(e) => {
                warn!(token, error = %e, "Volatility unavailable");
                None
            }
        };
        let threshold_cfg = self.thresholds.config();
        let market_condition = MarketCondition::classify(
            volatility,
            threshold_cfg.volatility_low_bound,
            threshold_cfg.volatility_high_bound,
        );
        let ctx = TradeContext {
            token: token.to_string(),
            current_price: signal.current_price,
            predicted_price: signal.predicted_price,
            diff_pct: signal.diff_pct,
            direction: signal.direction,
            market_condition,
            volatility,
        };

        let opinions = self.panel.collect(&ctx).await;
        if opinions.values().all(|o| o.is_none()) {
            let err = EngineError::NoConsensusProvider {
                token: token.to_string(),
            };
            warn!(token, asked = opinions.len(), "{}, holding", err);
            return self.hold(token, HoldReason::NoConsensusProvider);
        }

        trace!(token, state = %SignalState::Consensus);
        let market_events = match &self.market_events {
            Some(feed) => feed.market_events(token).await.unwrap_or_else(|e| {
                debug!(token, error = %e, "Market events unavailable");
                None
            }),
            None => None,
        };
        let result = self.consensus.score(
            &opinions,
            &ConsensusContext {
                volatility,
                market_events,
            },
        );

        let history = match self
            .history
            .trailing_stats(token, threshold_cfg.history_window_days)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                debug!(token, error = %e, "Performance history unavailable");
                None
            }
        };
        let breakdown = self.thresholds.explain(&ThresholdContext {
            volatility,
            token: Some(token.to_string()),
            market_condition,
            history,
        });
        let threshold = breakdown.threshold;

        if result.approves(threshold) {
            trace!(token, state = %SignalState::Approved);
            let order = OrderRequest::from_signal(&signal);
            match self.exchange.place_bracket_order(&order).await {
                Ok(order_id) => {
                    info!(
                        token,
                        direction = %signal.direction,
                        diff_pct = signal.diff_pct,
                        score = result.score,
                        threshold,
                        profit_target_pct = order.profit_target_pct,
                        stop_loss_pct = order.stop_loss_pct,
                        order_id = %order_id,
                        "Signal approved, order placed"
                    );
                    self.record(DecisionEvent::SignalEmitted {
                        token: token.to_string(),
                        direction: signal.direction,
                        diff_pct: signal.diff_pct,
                        score: result.score,
                        threshold,
                        order_id: order_id.clone(),
                        profit_target_pct: order.profit_target_pct,
                        stop_loss_pct: order.stop_loss_pct,
                    })
                    .await;
                    TokenOutcome::Emitted {
                        order_id,
                        direction: signal.direction,
                        score: result.score,
                        threshold,
                    }
                }
                Err(e) => {
                    let err = EngineError::Exchange(format!("{:#}", e));
                    error!(token, error = %err, "Order placement failed");
                    self.hold(token, HoldReason::OrderFailed)
                }
            }
        } else {
            trace!(token, state = %SignalState::Rejected);
            let mut responded: Vec<ReviewOpinion> = opinions.into_values().flatten().collect();
            responded.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));

            info!(
                token,
                direction = %signal.direction,
                score = result.score,
                threshold,
                vol_adj = breakdown.volatility_adjustment,
                hist_adj = breakdown.history_adjustment,
                cond_adj = breakdown.condition_adjustment,
                "Signal rejected by consensus"
            );
            for opinion in &responded {
                info!(
                    token,
                    provider = %opinion.provider_id,
                    approval = opinion.approval,
                    confidence = opinion.confidence,
                    risk = opinion.risk_score,
                    contribution = result.per_provider_contribution.get(&opinion.provider_id).copied().unwrap_or(0.0),
                    reasoning = %opinion.reasoning,
                    "Reviewer opinion"
                );
            }

            self.record(DecisionEvent::Rejected {
                token: token.to_string(),
                direction: signal.direction,
                score: result.score,
                threshold,
                opinions: responded,
            })
            .await;
            TokenOutcome::Rejected {
                direction: signal.direction,
                score: result.score,
                threshold,
            }
        }
    }

    fn hold(&self, token: &str, reason: HoldReason) -> TokenOutcome {
        debug!(token, state = %SignalState::Hold, reason = %reason);
        TokenOutcome::Hold(reason)
    }

    async fn record(&self, event: DecisionEvent) {
        if let Err(e) = self.events.record(&event).await {
            let err = EngineError::Persistence(format!("{:#}", e));
            warn!(kind = event.kind(), token = event.token(), error = %err, "Event not recorded");
        }
    }
}
