//! CSV Persistence Module
//!
//! Audit trail of every decision plus the closed-trade journal that feeds
//! per-token performance back into the threshold.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info};

use crate::engine::HoldReason;
use crate::freshness::FreshnessReason;
use crate::threshold::HistoricalStats;
use crate::types::{Direction, PositionSide, ReviewOpinion};

/// Everything the engine decides, as recorded for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionEvent {
    SignalEmitted {
        token: String,
        direction: Direction,
        diff_pct: f64,
        score: f64,
        threshold: f64,
        order_id: String,
        profit_target_pct: f64,
        stop_loss_pct: f64,
    },
    Rejected {
        token: String,
        direction: Direction,
        score: f64,
        threshold: f64,
        opinions: Vec<ReviewOpinion>,
    },
    FreshnessRejected {
        token: String,
        channel: String,
        reason: FreshnessReason,
        age_seconds: f64,
        latency_seconds: f64,
    },
    Hold {
        token: String,
        reason: HoldReason,
    },
    PositionClosed {
        token: String,
        side: PositionSide,
        entry_price: f64,
        exit_price: f64,
        pnl_pct: f64,
        /// Forecast divergence that triggered the close; `None` for bracket exits
        pred_diff_pct: Option<f64>,
    },
}

impl DecisionEvent {
    pub fn token(&self) -> &str {
        match self {
            DecisionEvent::SignalEmitted { token, .. }
            | DecisionEvent::Rejected { token, .. }
            | DecisionEvent::FreshnessRejected { token, .. }
            | DecisionEvent::Hold { token, .. }
            | DecisionEvent::PositionClosed { token, .. } => token,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DecisionEvent::SignalEmitted { .. } => "signal_emitted",
            DecisionEvent::Rejected { .. } => "rejected",
            DecisionEvent::FreshnessRejected { .. } => "freshness_rejected",
            DecisionEvent::Hold { .. } => "hold",
            DecisionEvent::PositionClosed { .. } => "position_closed",
        }
    }
}

/// Fire-and-forget audit sink. Callers log failures and move on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn record(&self, event: &DecisionEvent) -> Result<()>;
}

/// Realized per-token performance over a trailing window
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PerformanceHistory: Send + Sync {
    async fn trailing_stats(&self, token: &str, window_days: i64) -> Result<Option<HistoricalStats>>;
}

/// Event row for CSV storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: i64,
    pub kind: String,
    pub token: String,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Full event as JSON
    pub detail: String,
}

impl EventRecord {
    pub fn from_event(event: &DecisionEvent, at: DateTime<Utc>) -> Result<Self> {
        let (direction, score, threshold) = match event {
            DecisionEvent::SignalEmitted {
                direction,
                score,
                threshold,
                ..
            }
            | DecisionEvent::Rejected {
                direction,
                score,
                threshold,
                ..
            } => (Some(direction.to_string()), Some(*score), Some(*threshold)),
            _ => (None, None, None),
        };
        Ok(Self {
            timestamp: at.timestamp_millis(),
            kind: event.kind().to_string(),
            token: event.token().to_string(),
            direction,
            score,
            threshold,
            detail: serde_json::to_string(event).context("Failed to encode event detail")?,
        })
    }
}

/// Closed trade for CSV storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub token: String,
    pub side: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_pct: f64,
}

impl TradeRecord {
    /// Only `PositionClosed` events produce a journal row.
    pub fn from_event(event: &DecisionEvent, at: DateTime<Utc>) -> Option<Self> {
        match event {
            DecisionEvent::PositionClosed {
                token,
                side,
                entry_price,
                exit_price,
                pnl_pct,
                ..
            } => Some(Self {
                timestamp: at.timestamp_millis(),
                token: token.clone(),
                side: side.to_string(),
                entry_price: *entry_price,
                exit_price: *exit_price,
                pnl_pct: *pnl_pct,
            }),
            _ => None,
        }
    }
}

fn stats_since<'a>(
    trades: impl IntoIterator<Item = &'a TradeRecord>,
    token: &str,
    since_ms: i64,
) -> Option<HistoricalStats> {
    let pnls: Vec<f64> = trades
        .into_iter()
        .filter(|t| t.token == token && t.timestamp >= since_ms)
        .map(|t| t.pnl_pct)
        .collect();
    HistoricalStats::from_pnls(&pnls)
}

/// CSV persistence manager
pub struct CsvPersistence {
    data_dir: PathBuf,
    event_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
    trade_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
}

impl CsvPersistence {
    /// Create a new CSV persistence manager
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);

        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(data_dir.join("events"))?;
        fs::create_dir_all(data_dir.join("trades"))?;

        let today = Utc::now().format("%Y-%m-%d");

        let event_writer =
            Self::create_writer(&data_dir.join("events"), &format!("events_{}.csv", today))?;
        let trade_writer =
            Self::create_writer(&data_dir.join("trades"), &format!("trades_{}.csv", today))?;

        info!(data_dir = %data_dir.display(), "CSV persistence ready");

        Ok(Self {
            data_dir,
            event_writer: Arc::new(AsyncRwLock::new(event_writer)),
            trade_writer: Arc::new(AsyncRwLock::new(trade_writer)),
        })
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    pub async fn save_event(&self, record: EventRecord) -> Result<()> {
        let mut writer = self.event_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write event record")?;
        writer.flush().context("Failed to flush event writer")?;
        Ok(())
    }

    pub async fn save_trade(&self, record: TradeRecord) -> Result<()> {
        let mut writer = self.trade_writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write trade record")?;
        writer.flush().context("Failed to flush trade writer")?;
        Ok(())
    }

    /// Load closed trades stamped at or after `since_ms` from every journal file.
    /// Files are named by the day the process started, so a long run keeps
    /// appending to an old file.
    pub fn load_trades_since(&self, since_ms: i64) -> Result<Vec<TradeRecord>> {
        let dir = self.data_dir.join("trades");
        let mut records = Vec::new();

        for entry in fs::read_dir(&dir).context("Failed to list trade files")? {
            let path = entry?.path();
            let is_journal = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("trades_") && n.ends_with(".csv"))
                .unwrap_or(false);
            if !is_journal {
                continue;
            }

            let file = std::fs::File::open(&path).context("Failed to open trade file")?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
            for result in reader.deserialize() {
                let record: TradeRecord = result.context("Failed to deserialize trade record")?;
                if record.timestamp >= since_ms {
                    records.push(record);
                }
            }
        }

        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    /// Load recorded events from the last `days` daily files
    pub fn load_event_history(&self, days: u32) -> Result<Vec<EventRecord>> {
        let mut records = Vec::new();

        for i in 0..days {
            let date = Utc::now() - chrono::Duration::days(i as i64);
            let filename = format!("events_{}.csv", date.format("%Y-%m-%d"));
            let path = self.data_dir.join("events").join(&filename);

            if path.exists() {
                let file = std::fs::File::open(&path).context("Failed to open event file")?;
                let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

                for result in reader.deserialize() {
                    let record: EventRecord =
                        result.context("Failed to deserialize event record")?;
                    records.push(record);
                }
            }
        }

        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

#[async_trait]
impl EventLog for CsvPersistence {
    async fn record(&self, event: &DecisionEvent) -> Result<()> {
        let now = Utc::now();
        self.save_event(EventRecord::from_event(event, now)?).await?;
        if let Some(trade) = TradeRecord::from_event(event, now) {
            self.save_trade(trade).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PerformanceHistory for CsvPersistence {
    async fn trailing_stats(&self, token: &str, window_days: i64) -> Result<Option<HistoricalStats>> {
        let since = (Utc::now() - chrono::Duration::days(window_days)).timestamp_millis();
        let trades = self.load_trades_since(since)?;
        let stats = stats_since(&trades, token, since);
        debug!(token, window_days, stats = ?stats, "Trailing performance loaded");
        Ok(stats)
    }
}

/// Events kept by a [`MemoryJournal`] before the oldest are dropped
pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

/// Closed trades older than this are pruned from a [`MemoryJournal`]
pub const TRADE_RETENTION_DAYS: i64 = 90;

/// In-process journal used for dry runs without a data directory, and in tests.
/// Keeps the most recent events up to its capacity. Closed trades are held
/// separately so performance history survives event eviction.
pub struct MemoryJournal {
    capacity: usize,
    events: RwLock<VecDeque<(DateTime<Utc>, DecisionEvent)>>,
    trades: RwLock<VecDeque<TradeRecord>>,
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::new()),
            trades: RwLock::new(VecDeque::new()),
        }
    }

    pub fn events(&self) -> Vec<DecisionEvent> {
        self.events
            .read()
            .map(|e| e.iter().map(|(_, ev)| ev.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .read()
            .map(|e| e.iter().filter(|(_, ev)| ev.kind() == kind).count())
            .unwrap_or(0)
    }

    fn push_trade(&self, trade: TradeRecord) -> Result<()> {
        let cutoff = (Utc::now() - chrono::Duration::days(TRADE_RETENTION_DAYS)).timestamp_millis();
        let mut trades = self
            .trades
            .write()
            .map_err(|_| anyhow::anyhow!("journal lock poisoned"))?;
        trades.push_back(trade);
        while trades.front().map(|t| t.timestamp < cutoff).unwrap_or(false) {
            trades.pop_front();
        }
        while trades.len() > self.capacity {
            trades.pop_front();
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryJournal {
    async fn record(&self, event: &DecisionEvent) -> Result<()> {
        let now = Utc::now();
        {
            let mut events = self
                .events
                .write()
                .map_err(|_| anyhow::anyhow!("journal lock poisoned"))?;
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back((now, event.clone()));
        }
        if let Some(trade) = TradeRecord::from_event(event, now) {
            self.push_trade(trade)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PerformanceHistory for MemoryJournal {
    async fn trailing_stats(&self, token: &str, window_days: i64) -> Result<Option<HistoricalStats>> {
        let trades = self
            .trades
            .read()
            .map_err(|_| anyhow::anyhow!("journal lock poisoned"))?;
        let since = (Utc::now() - chrono::Duration::days(window_days)).timestamp_millis();
        Ok(stats_since(trades.iter(), token, since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(token: &str, pnl_pct: f64) -> DecisionEvent {
        DecisionEvent::PositionClosed {
            token: token.to_string(),
            side: PositionSide::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl_pct,
            pnl_pct,
            pred_diff_pct: Some(-0.02),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("signalgate-{}-{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_event_record_flattens_scores() {
        let event = DecisionEvent::Rejected {
            token: "ETH".to_string(),
            direction: Direction::Sell,
            score: 0.41,
            threshold: 0.55,
            opinions: vec![ReviewOpinion::new("deep", false, 70.0, 7.0).with_reasoning("overextended")],
        };
        let record = EventRecord::from_event(&event, Utc::now()).unwrap();
        assert_eq!(record.kind, "rejected");
        assert_eq!(record.direction.as_deref(), Some("SELL"));
        assert_eq!(record.threshold, Some(0.55));
        assert!(record.detail.contains("overextended"));

        let decoded: DecisionEvent = serde_json::from_str(&record.detail).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_only_closed_positions_enter_the_journal() {
        let hold = DecisionEvent::Hold {
            token: "BTC".to_string(),
            reason: HoldReason::BelowEntryBand,
        };
        assert!(TradeRecord::from_event(&hold, Utc::now()).is_none());
        assert!(TradeRecord::from_event(&closed("BTC", 3.0), Utc::now()).is_some());
    }

    #[tokio::test]
    async fn test_csv_round_trip_feeds_trailing_stats() {
        let dir = temp_dir("csv");
        let store = CsvPersistence::new(dir.to_str().unwrap()).unwrap();

        store.record(&closed("BTC", 4.0)).await.unwrap();
        store.record(&closed("BTC", 2.0)).await.unwrap();
        store.record(&closed("ETH", -9.0)).await.unwrap();
        store
            .record(&DecisionEvent::Hold {
                token: "BTC".to_string(),
                reason: HoldReason::HeuristicDisagrees,
            })
            .await
            .unwrap();

        let stats = store.trailing_stats("BTC", 7).await.unwrap().unwrap();
        assert_eq!(stats.trade_count, 2);
        assert!((stats.avg_pnl_pct - 3.0).abs() < 1e-9);
        assert!(store.trailing_stats("SOL", 7).await.unwrap().is_none());

        let events = store.load_event_history(1).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].kind, "hold");

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_trailing_stats_reads_file_opened_on_an_earlier_day() {
        let dir = temp_dir("longrun");
        fs::create_dir_all(dir.join("trades")).unwrap();
        let started = (Utc::now() - chrono::Duration::days(10)).format("%Y-%m-%d");
        let path = dir.join("trades").join(format!("trades_{}.csv", started));
        let mut writer = WriterBuilder::new().from_path(&path).unwrap();
        let now = Utc::now();
        for pnl in [1.0, 2.0, 3.0] {
            writer.serialize(TradeRecord::from_event(&closed("BTC", pnl), now).unwrap()).unwrap();
        }
        let stale = now - chrono::Duration::days(9);
        writer.serialize(TradeRecord::from_event(&closed("BTC", -50.0), stale).unwrap()).unwrap();
        writer.flush().unwrap();

        let store = CsvPersistence::new(dir.to_str().unwrap()).unwrap();
        let stats = store.trailing_stats("BTC", 7).await.unwrap().unwrap();
        assert_eq!(stats.trade_count, 3);
        assert!((stats.avg_pnl_pct - 2.0).abs() < 1e-9);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_memory_journal() {
        let journal = MemoryJournal::new();
        journal.record(&closed("SOL", -3.0)).await.unwrap();
        journal.record(&closed("SOL", -5.0)).await.unwrap();

        assert_eq!(journal.count("position_closed"), 2);
        let stats = journal.trailing_stats("SOL", 7).await.unwrap().unwrap();
        assert!((stats.avg_pnl_pct + 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_memory_journal_drops_oldest_events_past_capacity() {
        let journal = MemoryJournal::with_capacity(3);
        journal.record(&closed("ETH", 6.0)).await.unwrap();
        for _ in 0..5 {
            journal
                .record(&DecisionEvent::Hold {
                    token: "ETH".to_string(),
                    reason: HoldReason::BelowEntryBand,
                })
                .await
                .unwrap();
        }

        assert_eq!(journal.events().len(), 3);
        assert_eq!(journal.count("position_closed"), 0);
        // The closed trade outlives its event
        let stats = journal.trailing_stats("ETH", 7).await.unwrap().unwrap();
        assert_eq!(stats.trade_count, 1);
    }

    #[tokio::test]
    async fn test_memory_journal_prunes_trades_past_retention() {
        let journal = MemoryJournal::new();
        let old = Utc::now() - chrono::Duration::days(TRADE_RETENTION_DAYS + 5);
        journal
            .push_trade(TradeRecord::from_event(&closed("BTC", -8.0), old).unwrap())
            .unwrap();
        journal.record(&closed("BTC", 2.0)).await.unwrap();

        assert_eq!(journal.trades.read().unwrap().len(), 1);
        let stats = journal.trailing_stats("BTC", 3650).await.unwrap().unwrap();
        assert_eq!(stats.trade_count, 1);
        assert!((stats.avg_pnl_pct - 2.0).abs() < 1e-9);
    }
}
