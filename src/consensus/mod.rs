//! Consensus Validator - Weighted agreement across independent reviewers
//!
//! Each responding reviewer contributes
//! `confidence/100 * approval * (10 - risk)/10`, optionally blended with the
//! quality of the sources it cited. Contributions are weighted by the
//! dynamic provider weights, renormalized over the reviewers that actually
//! answered. A reviewer that did not answer is excluded from both sides of
//! the ratio.

mod weights;

pub use weights::{assign_weights, default_table, MarketEvents, ProviderProfile, ProviderRole};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::types::ReviewOpinion;

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    /// Volatility above which technical reviewers lose weight
    pub high_volatility_cutoff: f64,
    /// News impact above which research reviewers lead
    pub news_impact_threshold: f64,
    /// Share of a research reviewer's score taken from source quality
    pub quality_bonus_weight: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            high_volatility_cutoff: 0.03,
            news_impact_threshold: 0.5,
            quality_bonus_weight: 0.2,
        }
    }
}

/// Market inputs to the weighting function
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusContext {
    pub volatility: Option<f64>,
    pub market_events: Option<MarketEvents>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsensusResult {
    /// 0.0 - 1.0
    pub score: f64,
    /// Share of the final score contributed by each responder
    pub per_provider_contribution: HashMap<String, f64>,
    /// Sum of configured weights of the responders, before renormalization
    pub responding_weight_total: f64,
    /// Weights actually applied; sums to 1 across responders
    pub normalized_weights: HashMap<String, f64>,
}

impl ConsensusResult {
    pub fn responders(&self) -> usize {
        self.normalized_weights.len()
    }

    pub fn approves(&self, threshold: f64) -> bool {
        self.score >= threshold
    }
}

pub struct ConsensusValidator {
    config: ConsensusConfig,
    providers: Vec<ProviderProfile>,
}

impl ConsensusValidator {
    /// At least one reviewer is required.
    pub fn new(config: ConsensusConfig, providers: Vec<ProviderProfile>) -> Result<Self, EngineError> {
        if providers.is_empty() {
            return Err(EngineError::Configuration(
                "consensus requires at least one review provider".to_string(),
            ));
        }
        Ok(Self { config, providers })
    }

    pub fn providers(&self) -> &[ProviderProfile] {
        &self.providers
    }

    /// Configured weights for the current market, summing to 1
    pub fn weights(&self, volatility: Option<f64>, market_events: Option<MarketEvents>) -> HashMap<String, f64> {
        let volatile = volatility
            .map(|v| v > self.config.high_volatility_cutoff)
            .unwrap_or(false);
        let news_driven = market_events
            .map(|e| e.recent_news_impact > self.config.news_impact_threshold)
            .unwrap_or(false);
        assign_weights(&self.providers, volatile, news_driven)
    }

    /// Score of a single opinion before weighting, in [0, 1]
    pub fn raw_score(&self, opinion: &ReviewOpinion) -> f64 {
        if !opinion.approval {
            return 0.0;
        }
        // Non-finite values count as no confidence and maximum risk
        let confidence = if opinion.confidence.is_finite() {
            opinion.confidence.clamp(0.0, 100.0) / 100.0
        } else {
            0.0
        };
        let risk = if opinion.risk_score.is_finite() {
            opinion.risk_score.clamp(1.0, 10.0)
        } else {
            10.0
        };
        let base = confidence * ((10.0 - risk) / 10.0).max(0.0);

        match opinion.research.as_ref().and_then(|r| r.source_quality) {
            Some(tier) => {
                let w = self.config.quality_bonus_weight.clamp(0.0, 1.0);
                (1.0 - w) * base + w * tier.score()
            }
            None => base,
        }
    }

    /// Combine the opinions that came back. `None` entries are reviewers that
    /// failed to answer.
    pub fn score(
        &self,
        opinions: &HashMap<String, Option<ReviewOpinion>>,
        ctx: &ConsensusContext,
    ) -> ConsensusResult {
        let weights = self.weights(ctx.volatility, ctx.market_events);

        let mut responding: Vec<(&str, f64, f64)> = Vec::new();
        for (provider_id, opinion) in opinions {
            let Some(opinion) = opinion else {
                continue;
            };
            match weights.get(provider_id) {
                Some(&w) if w > 0.0 => {
                    responding.push((provider_id.as_str(), w, self.raw_score(opinion)));
                }
                Some(_) => {}
                None => warn!(provider = %provider_id, "Opinion from unconfigured provider ignored"),
            }
        }

        let responding_weight_total: f64 = responding.iter().map(|(_, w, _)| w).sum();
        if responding.is_empty() || responding_weight_total <= 0.0 {
            return ConsensusResult::default();
        }

        let mut per_provider_contribution = HashMap::new();
        let mut normalized_weights = HashMap::new();
        let mut score = 0.0;
        for (provider_id, w, raw) in responding {
            let norm = w / responding_weight_total;
            let contribution = raw * norm;
            score += contribution;
            normalized_weights.insert(provider_id.to_string(), norm);
            per_provider_contribution.insert(provider_id.to_string(), contribution);
        }
        let score = score.clamp(0.0, 1.0);

        debug!(
            score,
            responders = normalized_weights.len(),
            configured = self.providers.len(),
            weight_total = responding_weight_total,
            "Consensus computed"
        );

        ConsensusResult {
            score,
            per_provider_contribution,
            responding_weight_total,
            normalized_weights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResearchMetadata, SourceQualityTier};

    fn pair() -> ConsensusValidator {
        ConsensusValidator::new(
            ConsensusConfig::default(),
            vec![
                ProviderProfile::new("fast", ProviderRole::Technical),
                ProviderProfile::new("deep", ProviderRole::Reasoning),
            ],
        )
        .unwrap()
    }

    fn trio() -> ConsensusValidator {
        ConsensusValidator::new(
            ConsensusConfig::default(),
            vec![
                ProviderProfile::new("fast", ProviderRole::Technical),
                ProviderProfile::new("deep", ProviderRole::Reasoning),
                ProviderProfile::new("search", ProviderRole::Research),
            ],
        )
        .unwrap()
    }

    fn opinions(entries: Vec<(&str, Option<ReviewOpinion>)>) -> HashMap<String, Option<ReviewOpinion>> {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_two_provider_weighted_score() {
        let validator = pair();
        let ops = opinions(vec![
            ("fast", Some(ReviewOpinion::new("fast", true, 80.0, 3.0))),
            ("deep", Some(ReviewOpinion::new("deep", true, 75.0, 4.0))),
        ]);
        let ctx = ConsensusContext {
            volatility: Some(0.02),
            market_events: None,
        };

        let result = validator.score(&ops, &ctx);
        // 0.56 * 0.6 + 0.45 * 0.4
        assert!((result.score - 0.516).abs() < 1e-9);
        assert!((result.per_provider_contribution["fast"] - 0.336).abs() < 1e-9);
        assert!((result.per_provider_contribution["deep"] - 0.18).abs() < 1e-9);
        assert!((result.responding_weight_total - 1.0).abs() < 1e-9);
        assert!(result.approves(0.5));
        assert!(!result.approves(0.55));
    }

    #[test]
    fn test_no_responders_scores_zero() {
        let validator = trio();
        let ops = opinions(vec![("fast", None), ("deep", None)]);
        let result = validator.score(&ops, &ConsensusContext::default());
        assert_eq!(result.score, 0.0);
        assert_eq!(result.responding_weight_total, 0.0);
        assert_eq!(result.responders(), 0);

        let empty = validator.score(&HashMap::new(), &ConsensusContext::default());
        assert_eq!(empty.score, 0.0);
    }

    #[test]
    fn test_missing_provider_is_excluded_from_denominator() {
        let validator = trio();
        let ops = opinions(vec![
            ("fast", Some(ReviewOpinion::new("fast", true, 100.0, 1.0))),
            ("deep", None),
        ]);
        let result = validator.score(&ops, &ConsensusContext::default());
        assert!((result.normalized_weights["fast"] - 1.0).abs() < 1e-12);
        assert!((result.responding_weight_total - 0.40).abs() < 1e-12);
        // Single responder: score equals its raw score
        assert!((result.score - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_normalized_weights_sum_to_one_for_every_subset() {
        let validator = trio();
        let ids = ["fast", "deep", "search"];
        for mask in 1u8..8 {
            let ops: HashMap<String, Option<ReviewOpinion>> = ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    let op = if mask & (1 << i) != 0 {
                        Some(ReviewOpinion::new(*id, i % 2 == 0, 30.0 * i as f64 + 10.0, 2.0 + i as f64))
                    } else {
                        None
                    };
                    (id.to_string(), op)
                })
                .collect();
            for vol in [None, Some(0.01), Some(0.05)] {
                let ctx = ConsensusContext { volatility: vol, market_events: None };
                let result = validator.score(&ops, &ctx);
                let sum: f64 = result.normalized_weights.values().sum();
                assert!((sum - 1.0).abs() < 1e-9, "mask={} vol={:?}", mask, vol);
                assert!((0.0..=1.0).contains(&result.score));
            }
        }
    }

    #[test]
    fn test_rejection_contributes_nothing_but_counts_in_denominator() {
        let validator = pair();
        let ops = opinions(vec![
            ("fast", Some(ReviewOpinion::new("fast", false, 99.0, 1.0))),
            ("deep", Some(ReviewOpinion::new("deep", true, 100.0, 1.0))),
        ]);
        let result = validator.score(&ops, &ConsensusContext::default());
        assert!((result.score - 0.9 * 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_high_volatility_swaps_two_provider_weights() {
        let validator = pair();
        let calm = validator.weights(Some(0.02), None);
        assert_eq!(calm["fast"], 0.6);
        let wild = validator.weights(Some(0.031), None);
        assert_eq!(wild["fast"], 0.4);
        assert_eq!(wild["deep"], 0.6);
    }

    #[test]
    fn test_volatility_moves_weight_off_technical_configured_second() {
        let validator = ConsensusValidator::new(
            ConsensusConfig::default(),
            vec![
                ProviderProfile::new("reasoner", ProviderRole::Reasoning),
                ProviderProfile::new("chartist", ProviderRole::Technical),
            ],
        )
        .unwrap();

        let calm = validator.weights(Some(0.01), None);
        assert_eq!(calm["chartist"], 0.6);
        assert_eq!(calm["reasoner"], 0.4);

        let wild = validator.weights(Some(0.05), None);
        assert_eq!(wild["chartist"], 0.4);
        assert_eq!(wild["reasoner"], 0.6);
    }

    #[test]
    fn test_non_finite_opinion_values_stay_in_range() {
        let validator = pair();
        let mut nan_conf = ReviewOpinion::new("fast", true, 80.0, 2.0);
        nan_conf.confidence = f64::NAN;
        assert_eq!(validator.raw_score(&nan_conf), 0.0);

        let mut nan_risk = ReviewOpinion::new("deep", true, 80.0, 2.0);
        nan_risk.risk_score = f64::NAN;
        assert_eq!(validator.raw_score(&nan_risk), 0.0);

        let ops = opinions(vec![("fast", Some(nan_conf)), ("deep", Some(nan_risk))]);
        let result = validator.score(&ops, &ConsensusContext::default());
        assert!(result.score.is_finite());
        assert!((0.0..=1.0).contains(&result.score));
    }

    #[test]
    fn test_news_shifts_weight_to_research() {
        let validator = trio();
        let events = Some(MarketEvents { recent_news_impact: 0.8 });
        let w = validator.weights(None, events);
        let max = w.values().cloned().fold(f64::MIN, f64::max);
        assert_eq!(w["search"], max);

        let quiet = validator.weights(None, Some(MarketEvents { recent_news_impact: 0.1 }));
        assert_eq!(quiet["search"], 0.25);
    }

    #[test]
    fn test_quality_bonus_rewards_cited_research() {
        let validator = trio();
        let plain = ReviewOpinion::new("search", true, 50.0, 5.0);
        let cited = plain.clone().with_research(ResearchMetadata {
            source_quality: Some(SourceQualityTier::VeryHigh),
            citation_count: Some(12),
        });
        let uncited = plain.clone().with_research(ResearchMetadata {
            source_quality: None,
            citation_count: Some(0),
        });

        // 0.5 * 0.5 = 0.25
        assert!((validator.raw_score(&plain) - 0.25).abs() < 1e-12);
        // 0.8 * 0.25 + 0.2 * 1.0
        assert!((validator.raw_score(&cited) - 0.40).abs() < 1e-12);
        assert!((validator.raw_score(&uncited) - 0.25).abs() < 1e-12);

        let rejected = ReviewOpinion::new("search", false, 90.0, 2.0).with_research(ResearchMetadata {
            source_quality: Some(SourceQualityTier::VeryHigh),
            citation_count: Some(30),
        });
        assert_eq!(validator.raw_score(&rejected), 0.0);
    }

    #[test]
    fn test_unconfigured_provider_is_ignored() {
        let validator = pair();
        let ops = opinions(vec![("rogue", Some(ReviewOpinion::new("rogue", true, 100.0, 1.0)))]);
        let result = validator.score(&ops, &ConsensusContext::default());
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_score_is_deterministic() {
        let validator = trio();
        let ops = opinions(vec![
            ("fast", Some(ReviewOpinion::new("fast", true, 66.0, 3.0))),
            ("deep", Some(ReviewOpinion::new("deep", true, 71.0, 6.0))),
            ("search", Some(ReviewOpinion::new("search", false, 40.0, 8.0))),
        ]);
        let ctx = ConsensusContext { volatility: Some(0.035), market_events: None };
        let a = validator.score(&ops, &ctx);
        let b = validator.score(&ops, &ctx);
        assert_eq!(a.score.to_bits(), b.score.to_bits());
    }

    #[test]
    fn test_requires_a_provider() {
        let err = ConsensusValidator::new(ConsensusConfig::default(), Vec::new()).err().unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
