//! Chat-completions reviewer
//!
//! Talks to any OpenAI-compatible endpoint and asks the model for a JSON
//! verdict. Replies are parsed leniently: fenced blocks, bare objects and
//! objects embedded in prose are all accepted.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::ReviewProvider;
use crate::consensus::{ProviderProfile, ProviderRole};
use crate::types::{ResearchMetadata, ReviewOpinion, SourceQualityTier, TradeContext};

#[derive(Debug, Clone, Deserialize)]
pub struct LlmReviewSettings {
    pub id: String,
    pub role: ProviderRole,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_secs: u64,
}

pub struct LlmReviewProvider {
    client: reqwest::Client,
    settings: LlmReviewSettings,
    api_key: String,
}

impl LlmReviewProvider {
    pub fn new(settings: LlmReviewSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env).unwrap_or_default();
        if api_key.is_empty() {
            warn!(provider = %settings.id, env = %settings.api_key_env, "API key not set, requests will be unauthenticated");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build reviewer HTTP client")?;
        Ok(Self {
            client,
            settings,
            api_key,
        })
    }

    fn prompt(&self, ctx: &TradeContext) -> String {
        let research_hint = if self.settings.role == ProviderRole::Research {
            ",\n  \"source_quality\": \"none|low|medium|high|very_high\",\n  \"citation_count\": <integer>"
        } else {
            ""
        };
        format!(
            "You are reviewing a proposed crypto trade.\n\n\
             Token: {token}\n\
             Direction: {direction}\n\
             Current price: {cur:.4}\n\
             Forecast price: {pred:.4}\n\
             Divergence: {diff:+.3}%\n\
             Market condition: {condition}\n\
             Volatility: {vol}\n\n\
             Respond with JSON only:\n\
             {{\n  \"approval\": true or false,\n  \"confidence\": <0-100>,\n  \"risk_score\": <1-10>,\n  \"reasoning\": \"...\"{research}\n}}",
            token = ctx.token,
            direction = ctx.direction,
            cur = ctx.current_price,
            pred = ctx.predicted_price,
            diff = ctx.diff_pct * 100.0,
            condition = ctx.market_condition,
            vol = ctx
                .volatility
                .map(|v| format!("{:.4}", v))
                .unwrap_or_else(|| "unknown".to_string()),
            research = research_hint,
        )
    }

    async fn call_model(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "messages": [{"role": "user", "content": prompt}]
        });

        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        let msg = &resp["choices"][0]["message"];
        msg["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .or_else(|| msg["reasoning"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("No content in completion response"))
    }
}

#[async_trait]
impl ReviewProvider for LlmReviewProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile::new(self.settings.id.clone(), self.settings.role)
    }

    async fn review(&self, ctx: &TradeContext) -> Option<ReviewOpinion> {
        let prompt = self.prompt(ctx);
        let content = match self.call_model(&prompt).await {
            Ok(c) => c,
            Err(e) => {
                warn!(provider = %self.settings.id, token = %ctx.token, error = %e, "Review request failed");
                return None;
            }
        };

        let opinion = parse_opinion(&self.settings.id, &content);
        match &opinion {
            Some(o) => debug!(provider = %self.settings.id, token = %ctx.token, opinion = %o, "Review received"),
            None => warn!(provider = %self.settings.id, token = %ctx.token, "Unparseable review reply"),
        }
        opinion
    }
}

#[derive(Debug, Deserialize)]
struct RawOpinion {
    approval: serde_json::Value,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default, alias = "risk")]
    risk_score: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, alias = "sourceQualityTier")]
    source_quality: Option<String>,
    #[serde(default, alias = "citations")]
    citation_count: Option<u32>,
}

fn approval_flag(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "approve" | "approved" => Some(true),
            "false" | "no" | "reject" | "rejected" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Extract a `ReviewOpinion` from a model reply. Returns `None` when no
/// usable verdict is present.
pub fn parse_opinion(provider_id: &str, raw: &str) -> Option<ReviewOpinion> {
    let json_str = if let Some(s) = raw.find("```json") {
        let start = s + 7;
        let end = raw[start..].find("```").map(|i| start + i).unwrap_or(raw.len());
        &raw[start..end]
    } else if raw.trim().starts_with('{') {
        raw.trim()
    } else if let (Some(s), Some(e)) = (raw.find('{'), raw.rfind('}')) {
        if s >= e {
            return None;
        }
        &raw[s..=e]
    } else {
        return None;
    };

    let parsed: RawOpinion = match serde_json::from_str(json_str.trim()) {
        Ok(p) => p,
        Err(e) => {
            debug!(provider = provider_id, error = %e, "Review JSON parse failed");
            return None;
        }
    };

    let approval = approval_flag(&parsed.approval)?;
    let mut opinion = ReviewOpinion::new(
        provider_id,
        approval,
        parsed.confidence.unwrap_or(0.0),
        parsed.risk_score.unwrap_or(10.0),
    )
    .with_reasoning(parsed.reasoning.unwrap_or_default());

    let source_quality = parsed.source_quality.as_deref().and_then(SourceQualityTier::from_str);
    if source_quality.is_some() || parsed.citation_count.is_some() {
        opinion = opinion.with_research(ResearchMetadata {
            source_quality,
            citation_count: parsed.citation_count,
        });
    }

    Some(opinion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_reply() {
        let raw = "Here you go:\n```json\n{\"approval\": true, \"confidence\": 82, \"risk_score\": 3, \"reasoning\": \"trend intact\"}\n```";
        let op = parse_opinion("deep", raw).unwrap();
        assert!(op.approval);
        assert_eq!(op.confidence, 82.0);
        assert_eq!(op.risk_score, 3.0);
        assert_eq!(op.reasoning, "trend intact");
        assert!(op.research.is_none());
    }

    #[test]
    fn test_parse_embedded_object_with_research() {
        let raw = "I think {\"approval\": \"yes\", \"confidence\": 60, \"risk_score\": 5, \"source_quality\": \"very_high\", \"citation_count\": 9} is right";
        let op = parse_opinion("search", raw).unwrap();
        let research = op.research.unwrap();
        assert_eq!(research.source_quality, Some(SourceQualityTier::VeryHigh));
        assert_eq!(research.citation_count, Some(9));
    }

    #[test]
    fn test_parse_clamps_out_of_range_values() {
        let op = parse_opinion("x", "{\"approval\": false, \"confidence\": 250, \"risk_score\": 0}").unwrap();
        assert_eq!(op.confidence, 100.0);
        assert_eq!(op.risk_score, 1.0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_opinion("x", "no json here").is_none());
        assert!(parse_opinion("x", "{\"confidence\": 50}").is_none());
        assert!(parse_opinion("x", "{\"approval\": \"maybe\"}").is_none());
    }
}
