//! Review providers - independent reviewers asked to approve a candidate trade
//!
//! A provider never fails past its own boundary: transport errors, timeouts
//! and unparseable replies all come back as `None`.

mod llm;

pub use llm::{parse_opinion, LlmReviewProvider, LlmReviewSettings};

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::consensus::ProviderProfile;
use crate::error::EngineError;
use crate::types::{ReviewOpinion, TradeContext};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    /// Identity and capability of this reviewer
    fn profile(&self) -> ProviderProfile;

    /// `None` means the reviewer did not answer
    async fn review(&self, ctx: &TradeContext) -> Option<ReviewOpinion>;
}

/// Fans a trade out to every configured reviewer at once
pub struct ReviewPanel {
    providers: Vec<Arc<dyn ReviewProvider>>,
    timeout: Duration,
}

impl ReviewPanel {
    pub fn new(providers: Vec<Arc<dyn ReviewProvider>>, timeout: Duration) -> Result<Self, EngineError> {
        if providers.is_empty() {
            return Err(EngineError::Configuration(
                "review panel requires at least one provider".to_string(),
            ));
        }
        Ok(Self { providers, timeout })
    }

    pub fn profiles(&self) -> Vec<ProviderProfile> {
        self.providers.iter().map(|p| p.profile()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Ask every reviewer concurrently. Every configured provider gets an
    /// entry; slow or failed reviewers map to `None`.
    pub async fn collect(&self, ctx: &TradeContext) -> HashMap<String, Option<ReviewOpinion>> {
        let calls = self.providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let timeout = self.timeout;
            async move {
                let id = provider.profile().id;
                let opinion = match tokio::time::timeout(timeout, provider.review(ctx)).await {
                    Ok(opinion) => opinion,
                    Err(_) => {
                        warn!(provider = %id, token = %ctx.token, timeout_secs = timeout.as_secs(), "Review timed out");
                        None
                    }
                };
                (id, opinion)
            }
        });

        let results: HashMap<String, Option<ReviewOpinion>> = join_all(calls).await.into_iter().collect();
        debug!(
            token = %ctx.token,
            responded = results.values().filter(|o| o.is_some()).count(),
            asked = results.len(),
            "Review round complete"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ProviderRole;
    use crate::types::{Direction, MarketCondition};

    fn ctx() -> TradeContext {
        TradeContext {
            token: "BTC".to_string(),
            current_price: 100.0,
            predicted_price: 103.0,
            diff_pct: 0.03,
            direction: Direction::Buy,
            market_condition: MarketCondition::Normal,
            volatility: Some(0.02),
        }
    }

    fn mock(id: &'static str, answer: Option<ReviewOpinion>) -> Arc<dyn ReviewProvider> {
        let mut m = MockReviewProvider::new();
        m.expect_profile()
            .returning(move || ProviderProfile::new(id, ProviderRole::Reasoning));
        m.expect_review().returning(move |_| answer.clone());
        Arc::new(m)
    }

    struct Sleeper;

    #[async_trait]
    impl ReviewProvider for Sleeper {
        fn profile(&self) -> ProviderProfile {
            ProviderProfile::new("slow", ProviderRole::Research)
        }

        async fn review(&self, _ctx: &TradeContext) -> Option<ReviewOpinion> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Some(ReviewOpinion::new("slow", true, 90.0, 2.0))
        }
    }

    #[tokio::test]
    async fn test_panel_tolerates_partial_failure() {
        let panel = ReviewPanel::new(
            vec![
                mock("a", Some(ReviewOpinion::new("a", true, 80.0, 3.0))),
                mock("b", None),
            ],
            Duration::from_secs(1),
        )
        .unwrap();

        let results = panel.collect(&ctx()).await;
        assert_eq!(results.len(), 2);
        assert!(results["a"].is_some());
        assert!(results["b"].is_none());
    }

    #[tokio::test]
    async fn test_slow_reviewer_times_out_without_blocking_others() {
        let panel = ReviewPanel::new(
            vec![
                mock("fast", Some(ReviewOpinion::new("fast", true, 70.0, 2.0))),
                Arc::new(Sleeper),
            ],
            Duration::from_millis(50),
        )
        .unwrap();

        let results = panel.collect(&ctx()).await;
        assert!(results["fast"].is_some());
        assert!(results["slow"].is_none());
    }

    #[test]
    fn test_empty_panel_is_a_configuration_error() {
        let err = ReviewPanel::new(Vec::new(), Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
