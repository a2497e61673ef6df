//! Prediction sources - where forecasts come from

mod http;

pub use http::{HttpPredictionSource, PredictionHttpSettings};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::EngineError;
use crate::retry::RetryPolicy;
use crate::types::PredictionSample;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PredictionSource: Send + Sync {
    /// Latest forecast on `channel_id`. Implementations must fill
    /// `observed_at` from a wall clock comparable to ours.
    async fn fetch(&self, channel_id: &str) -> Result<PredictionSample>;
}

/// Fetch under `policy`, mapping exhaustion to `TransientFetch`.
pub async fn fetch_with_retry(
    source: &dyn PredictionSource,
    channel_id: &str,
    policy: &RetryPolicy,
) -> Result<PredictionSample, EngineError> {
    policy
        .run(&format!("prediction:{}", channel_id), |_| source.fetch(channel_id))
        .await
        .map_err(|e| EngineError::TransientFetch {
            channel: channel_id.to_string(),
            attempts: policy.max_attempts,
            message: format!("{:#}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mockall::Sequence;
    use std::time::Duration;

    fn sample() -> PredictionSample {
        PredictionSample {
            value: 101.5,
            observed_at: Utc::now(),
            requested_at: Utc::now(),
            api_latency: Duration::from_millis(120),
            channel_id: "btc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_recovers_within_budget() {
        let mut source = MockPredictionSource::new();
        let mut seq = Sequence::new();
        source
            .expect_fetch()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("503")));
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sample()));

        let got = fetch_with_retry(&source, "btc", &RetryPolicy::immediate(3)).await.unwrap();
        assert_eq!(got.value, 101.5);
    }

    #[tokio::test]
    async fn test_fetch_exhaustion_is_transient_error() {
        let mut source = MockPredictionSource::new();
        source
            .expect_fetch()
            .times(3)
            .returning(|_| Err(anyhow::anyhow!("connection reset")));

        let err = fetch_with_retry(&source, "eth", &RetryPolicy::immediate(3)).await.unwrap_err();
        match err {
            EngineError::TransientFetch { channel, attempts, message } => {
                assert_eq!(channel, "eth");
                assert_eq!(attempts, 3);
                assert!(message.contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
