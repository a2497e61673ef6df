//! Fixed-interval cycle driver

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

use super::SignalEngine;
use crate::monitor::PositionMonitor;

/// Runs an engine cycle followed by a position review on every tick
pub struct Scheduler {
    engine: Arc<SignalEngine>,
    monitor: Arc<PositionMonitor>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<SignalEngine>, monitor: Arc<PositionMonitor>, interval: Duration) -> Self {
        Self {
            engine,
            monitor,
            interval,
        }
    }

    /// Loop until `shutdown` flips. An in-flight cycle is allowed to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
        }

        let stats = self.engine.stats();
        info!(
            cycles = stats.cycles,
            emitted = stats.emitted,
            rejected = stats.rejected,
            holds = stats.holds,
            "Scheduler stopped"
        );
    }

    /// One cycle: new entries first, then exits
    pub async fn tick(&self) {
        let report = self.engine.run_cycle().await;
        if report.ran {
            let channels = self.engine.active_channels().await;
            let reviews = self.monitor.run_once(&channels).await;
            let closed = reviews.iter().filter(|r| r.closed).count();
            if !reviews.is_empty() {
                info!(cycle = report.cycle, reviewed = reviews.len(), closed, "Positions reviewed");
            }
        }
    }
}
