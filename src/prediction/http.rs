//! REST forecast client
//!
//! `GET {base_url}/channels/{channel_id}/latest` returning an object with a
//! forecast value and the time the forecast was produced. Field names vary
//! between deployments, so a few aliases are accepted.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};

use super::PredictionSource;
use crate::types::PredictionSample;

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionHttpSettings {
    pub base_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
}

pub struct HttpPredictionSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPredictionSource {
    pub fn new(settings: &PredictionHttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build prediction HTTP client")?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&settings.api_key_env).ok().filter(|k| !k.is_empty()),
        })
    }
}

/// Unix seconds, unix milliseconds or RFC 3339
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_f64()?;
            let millis = if raw > 1e12 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

fn parse_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn parse_sample(
    json: &Value,
    channel_id: &str,
    requested_at: DateTime<Utc>,
    api_latency: Duration,
) -> Result<PredictionSample> {
    let value = ["value", "prediction", "price"]
        .iter()
        .find_map(|k| json.get(*k).and_then(parse_value))
        .ok_or_else(|| anyhow!("Forecast value missing for channel {}", channel_id))?;
    if !value.is_finite() {
        return Err(anyhow!("Non-finite forecast for channel {}", channel_id));
    }
    let observed_at = ["observed_at", "timestamp", "time"]
        .iter()
        .find_map(|k| json.get(*k).and_then(parse_timestamp))
        .ok_or_else(|| anyhow!("Forecast timestamp missing for channel {}", channel_id))?;

    Ok(PredictionSample {
        value,
        observed_at,
        requested_at,
        api_latency,
        channel_id: channel_id.to_string(),
    })
}

#[async_trait]
impl PredictionSource for HttpPredictionSource {
    async fn fetch(&self, channel_id: &str) -> Result<PredictionSample> {
        let url = format!("{}/channels/{}/latest", self.base_url, channel_id);
        let requested_at = Utc::now();
        let started = Instant::now();

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if !response.status().is_success() {
            return Err(anyhow!("Prediction API error: {}", response.status()));
        }

        let json: Value = response.json().await?;
        let api_latency = started.elapsed();

        parse_sample(&json, channel_id, requested_at, api_latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_sample_accepts_aliases() {
        let now = Utc::now();
        let body = json!({"prediction": "64123.5", "timestamp": 1_700_000_000});
        let sample = parse_sample(&body, "btc", now, Duration::from_millis(80)).unwrap();
        assert_eq!(sample.value, 64123.5);
        assert_eq!(sample.observed_at.timestamp(), 1_700_000_000);

        let body = json!({"value": 3.2, "observed_at": "2024-05-01T12:00:00Z"});
        let sample = parse_sample(&body, "eth", now, Duration::ZERO).unwrap();
        assert_eq!(sample.observed_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_millisecond_timestamps() {
        let body = json!({"price": 10, "time": 1_700_000_000_123i64});
        let sample = parse_sample(&body, "sol", Utc::now(), Duration::ZERO).unwrap();
        assert_eq!(sample.observed_at.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_missing_fields_are_errors() {
        assert!(parse_sample(&json!({"value": 1.0}), "x", Utc::now(), Duration::ZERO).is_err());
        assert!(parse_sample(&json!({"timestamp": 1}), "x", Utc::now(), Duration::ZERO).is_err());
    }
}
