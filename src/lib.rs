//! SignalGate Library
//!
//! Trade-decision engine: forecast freshness, adaptive thresholds and
//! weighted multi-reviewer consensus in front of a bracket-order exchange

pub mod config;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod freshness;
pub mod monitor;
pub mod persistence;
pub mod prediction;
pub mod retry;
pub mod review;
pub mod store;
pub mod strategy;
pub mod threshold;
pub mod types;

pub use config::AppConfig;
pub use consensus::{ConsensusResult, ConsensusValidator};
pub use engine::{CycleReport, Scheduler, SignalEngine, TokenOutcome};
pub use error::EngineError;
pub use freshness::{FreshnessGate, FreshnessVerdict};
pub use monitor::PositionMonitor;
pub use threshold::ThresholdEngine;
