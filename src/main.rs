//! SignalGate - forecast-gated trade decisions
//!
//! Wires the engine against the HTTP forecast service, the configured LLM
//! reviewers and the paper exchange, then cycles until Ctrl-C.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use signalgate::config::{AppConfig, HeuristicKind};
use signalgate::engine::{EngineParts, Scheduler, SignalEngine};
use signalgate::exchange::{run_price_poller, PaperExchange, PriceFeed, TickerPriceFeed};
use signalgate::freshness::FreshnessGate;
use signalgate::monitor::PositionMonitor;
use signalgate::persistence::{CsvPersistence, EventLog, MemoryJournal, PerformanceHistory};
use signalgate::prediction::HttpPredictionSource;
use signalgate::retry::RetryPolicy;
use signalgate::review::{LlmReviewProvider, ReviewProvider};
use signalgate::store::{ConfigStore, InMemoryConfigStore, StoreState};
use signalgate::strategy::{Abstain, HeuristicStrategy, MomentumHeuristic};
use signalgate::threshold::ThresholdEngine;

fn init_tracing(json: bool, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(config.logging.json, &config.logging.default_filter);

    info!("🚀 SignalGate starting");
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }
    info!(digest = %config.digest(), "Configuration loaded");

    // Collaborators
    let predictions = Arc::new(HttpPredictionSource::new(&config.prediction)?);

    let mut reviewers: Vec<Arc<dyn ReviewProvider>> = Vec::with_capacity(config.providers.len());
    for settings in &config.providers {
        let provider = LlmReviewProvider::new(settings.clone())
            .with_context(|| format!("Failed to build reviewer '{}'", settings.id))?;
        reviewers.push(Arc::new(provider));
    }

    let exchange = Arc::new(PaperExchange::new(config.paper.clone()));

    let initial = StoreState {
        mode: config.store.initial_mode,
        // Config keys may come back lowercased
        channels: config
            .store
            .channels
            .iter()
            .map(|(token, channel)| (token.to_uppercase(), channel.clone()))
            .collect(),
        pending: Default::default(),
    };
    let store: Arc<dyn ConfigStore> = match &config.store.state_file {
        Some(path) => Arc::new(InMemoryConfigStore::with_state_file(initial, PathBuf::from(path))?),
        None => Arc::new(InMemoryConfigStore::new(initial)),
    };

    let (events, history): (Arc<dyn EventLog>, Arc<dyn PerformanceHistory>) =
        if config.persistence.csv_enabled {
            let csv = Arc::new(CsvPersistence::new(&config.persistence.data_dir)?);
            let events: Arc<dyn EventLog> = csv.clone();
            (events, csv)
        } else {
            warn!("CSV persistence disabled, decisions are kept in memory only");
            let journal = Arc::new(MemoryJournal::new());
            let events: Arc<dyn EventLog> = journal.clone();
            (events, journal)
        };

    let heuristic: Arc<dyn HeuristicStrategy> = match config.heuristic.kind {
        HeuristicKind::Abstain => Arc::new(Abstain),
        HeuristicKind::Momentum => Arc::new(MomentumHeuristic::new(config.heuristic.momentum.clone())),
    };

    let retry = RetryPolicy::from(&config.retry);

    let engine = Arc::new(SignalEngine::new(
        config.engine.clone(),
        FreshnessGate::new(config.freshness.clone()),
        ThresholdEngine::new(config.threshold.clone()),
        config.consensus.clone(),
        retry,
        EngineParts {
            predictions: predictions.clone(),
            exchange: exchange.clone(),
            store: store.clone(),
            events: events.clone(),
            history,
            heuristic,
            reviewers,
            market_events: None,
        },
    )?);

    let monitor = Arc::new(PositionMonitor::new(
        config.monitor.clone(),
        predictions,
        exchange.clone(),
        events.clone(),
        retry,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Paper exchange price ticks and bracket exits
    let feed: Arc<dyn PriceFeed> = Arc::new(TickerPriceFeed::new(&config.price_feed)?);
    let poller = tokio::spawn(run_price_poller(
        exchange,
        feed,
        store,
        events,
        Duration::from_secs(config.price_feed.poll_interval_secs),
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("🛑 Shutdown requested, finishing current cycle");
        let _ = shutdown_tx.send(true);
    });

    let scheduler = Scheduler::new(
        engine.clone(),
        monitor,
        Duration::from_secs(config.engine.cycle_interval_secs),
    );
    scheduler.run(shutdown_rx).await;

    if let Err(e) = poller.await {
        warn!(error = %e, "Price poller ended abnormally");
    }

    let gate = engine.freshness_gate().stats();
    info!(
        checked = gate.total_checked,
        rejected_age = gate.rejected_by_age,
        rejected_latency = gate.rejected_by_latency,
        "👋 SignalGate stopped"
    );
    Ok(())
}
