use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{CacheClient, CacheError, RateDecision, RATE_LIMIT_SCRIPT};

/// Shared KV over the Upstash Redis REST protocol: each command is a JSON
/// array posted to the base URL with a Bearer token.
pub struct UpstashCache {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl UpstashCache {
    pub fn new(url: &str, token: &str) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CacheError::Upstash(e.to_string()))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn command(&self, args: Value) -> Result<Value, CacheError> {
        let resp = self
            .client
            .post(&self.url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&args)
            .send()
            .await
            .map_err(|e| CacheError::Upstash(e.to_string()))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CacheError::Upstash(format!("decode failed: {e}")))?;

        if let Some(err) = body.get("error").and_then(Value::as_str) {
            return Err(CacheError::Upstash(err.to_string()));
        }
        if !status.is_success() {
            return Err(CacheError::Upstash(format!("HTTP {}", status.as_u16())));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl CacheClient for UpstashCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let result = self.command(json!(["GET", key])).await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        self.command(json!(["SET", key, value, "PX", ttl_ms]))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.command(json!(["DEL", key])).await?;
        Ok(())
    }

    async fn rate_limit_check(
        &self,
        key: &str,
        window: Duration,
        max: u64,
        now_ms: i64,
    ) -> Result<RateDecision, CacheError> {
        let member = format!("{}-{}", now_ms, Uuid::new_v4());
        let result = self
            .command(json!([
                "EVAL",
                RATE_LIMIT_SCRIPT,
                "1",
                key,
                now_ms.to_string(),
                (window.as_millis() as i64).to_string(),
                max.to_string(),
                member
            ]))
            .await?;

        let pair = result
            .as_array()
            .ok_or_else(|| CacheError::Upstash(format!("unexpected EVAL result: {result}")))?;
        let allowed = pair.first().and_then(Value::as_i64).unwrap_or(0);
        let count = pair.get(1).and_then(Value::as_i64).unwrap_or(0);
        Ok(RateDecision {
            allowed: allowed == 1,
            count: count.max(0) as u64,
        })
    }

    fn backend(&self) -> &'static str {
        "upstash_kv"
    }
}
