//! Dynamic per-provider weighting
//!
//! Weight tables depend on how many reviewers are configured. Table slots are
//! handed out by rank. In calm markets technical reviewers lead, then the rest
//! in configuration order. In volatile markets technical reviewers drop to the
//! bottom. Research reviewers go to the top when news is moving the market.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// What kind of analysis a reviewer is good at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    /// Fast, chart/indicator driven
    Technical,
    /// General reasoning model
    Reasoning,
    /// Can browse and cite sources
    Research,
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderRole::Technical => write!(f, "technical"),
            ProviderRole::Reasoning => write!(f, "reasoning"),
            ProviderRole::Research => write!(f, "research"),
        }
    }
}

/// Identity of a configured reviewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub role: ProviderRole,
}

impl ProviderProfile {
    pub fn new(id: impl Into<String>, role: ProviderRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Market-moving news signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketEvents {
    /// 0.0 (nothing) - 1.0 (dominant story)
    pub recent_news_impact: f64,
}

/// Default weight table for `count` reviewers, highest weight first
pub fn default_table(count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![1.0],
        2 => vec![0.6, 0.4],
        3 => vec![0.40, 0.35, 0.25],
        n => {
            // Linearly decreasing: n, n-1, ..., 1
            let total = (n * (n + 1) / 2) as f64;
            (0..n).map(|i| (n - i) as f64 / total).collect()
        }
    }
}

/// Rank providers and assign table weights. Returned weights sum to 1.
pub fn assign_weights(
    providers: &[ProviderProfile],
    volatile: bool,
    news_driven: bool,
) -> HashMap<String, f64> {
    let table = default_table(providers.len());

    let mut ranked: Vec<(usize, &ProviderProfile)> = providers.iter().enumerate().collect();
    ranked.sort_by_key(|(idx, p)| {
        let news_rank = if news_driven && p.role == ProviderRole::Research { 0 } else { 1 };
        let role_rank = match (p.role, volatile) {
            (ProviderRole::Technical, false) => 0,
            (ProviderRole::Technical, true) => 2,
            _ => 1,
        };
        (news_rank, role_rank, *idx)
    });

    ranked
        .into_iter()
        .zip(table)
        .map(|((_, p), w)| (p.id.clone(), w))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trio() -> Vec<ProviderProfile> {
        vec![
            ProviderProfile::new("tech", ProviderRole::Technical),
            ProviderProfile::new("reason", ProviderRole::Reasoning),
            ProviderProfile::new("research", ProviderRole::Research),
        ]
    }

    #[test]
    fn test_tables_sum_to_one() {
        for n in 1..=8 {
            let sum: f64 = default_table(n).iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "n={}", n);
        }
    }

    #[test]
    fn test_technical_leads_in_calm_market_wherever_configured() {
        let profiles = vec![
            ProviderProfile::new("reasoner", ProviderRole::Reasoning),
            ProviderProfile::new("chartist", ProviderRole::Technical),
        ];
        let calm = assign_weights(&profiles, false, false);
        assert_eq!(calm["chartist"], 0.6);
        assert_eq!(calm["reasoner"], 0.4);

        let volatile = assign_weights(&profiles, true, false);
        assert_eq!(volatile["chartist"], 0.4);
        assert_eq!(volatile["reasoner"], 0.6);
    }

    #[test]
    fn test_non_technical_keep_configuration_order() {
        let profiles = vec![
            ProviderProfile::new("research", ProviderRole::Research),
            ProviderProfile::new("reason", ProviderRole::Reasoning),
            ProviderProfile::new("tech", ProviderRole::Technical),
        ];
        let w = assign_weights(&profiles, false, false);
        assert_eq!(w["tech"], 0.40);
        assert_eq!(w["research"], 0.35);
        assert_eq!(w["reason"], 0.25);
    }

    #[test]
    fn test_default_assignment_follows_configuration_order() {
        let w = assign_weights(&trio(), false, false);
        assert_eq!(w["tech"], 0.40);
        assert_eq!(w["reason"], 0.35);
        assert_eq!(w["research"], 0.25);
    }

    #[test]
    fn test_volatility_demotes_technical() {
        let w = assign_weights(&trio(), true, false);
        assert_eq!(w["reason"], 0.40);
        assert_eq!(w["research"], 0.35);
        assert_eq!(w["tech"], 0.25);
    }

    #[test]
    fn test_news_promotes_research_regardless_of_volatility() {
        let calm = assign_weights(&trio(), false, true);
        assert_eq!(calm["research"], 0.40);
        assert_eq!(calm["tech"], 0.35);

        let volatile = assign_weights(&trio(), true, true);
        assert_eq!(volatile["research"], 0.40);
        assert_eq!(volatile["reason"], 0.35);
        assert_eq!(volatile["tech"], 0.25);
    }
}
