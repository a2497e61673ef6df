//! Decision-path error taxonomy
//!
//! Collaborator seams return `anyhow::Result`; the engine classifies
//! failures into these variants when deciding how to degrade.

use crate::freshness::FreshnessReason;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Prediction fetch failed for channel {channel} after {attempts} attempts: {message}")]
    TransientFetch {
        channel: String,
        attempts: u32,
        message: String,
    },

    #[error("Stale forecast for {token}: {reason}")]
    StaleData {
        token: String,
        reason: FreshnessReason,
    },

    #[error("No review provider responded for {token}")]
    NoConsensusProvider { token: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Exchange error: {0}")]
    Exchange(String),
}

impl EngineError {
    /// Errors that only cost the current token its turn this cycle.
    pub fn is_token_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::TransientFetch { .. }
                | EngineError::StaleData { .. }
                | EngineError::NoConsensusProvider { .. }
                | EngineError::Exchange(_)
        )
    }
}
