use std::time::Instant;

use async_trait::async_trait;
use reqwest::header;
use serde_json::{json, Value};

use super::{parse_json, sse_events, AdapterBase, ChunkStream, ProviderAdapter, ProviderError};
use crate::models::chat::{ChatMessage, ChatParams, ChatResponse, StreamEvent, TokenUsage};
use crate::models::provider::ProviderKind;

/// OpenAI-compatible `chat/completions` dialect. Also covers the many
/// third-party upstreams that mirror it.
pub struct OpenAiAdapter {
    base: AdapterBase,
}

impl OpenAiAdapter {
    pub fn new(base: AdapterBase) -> Self {
        Self { base }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base.entry.resolved_base_url())
    }

    fn body(&self, messages: &[ChatMessage], params: &ChatParams, stream: bool) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.base.entry.model_id(),
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": stream,
        });
        // Many compatible providers only report usage on streams when asked
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        self.base.merge_extras(&mut body, params);
        body
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.base
            .client
            .client
            .post(self.url())
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.base.entry.api_key),
            )
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
    }
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage").filter(|u| !u.is_null())?;
    Some(TokenUsage {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        output_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    })
}

fn upstream_error(value: &Value) -> Option<ProviderError> {
    let err = value.get("error").filter(|e| !e.is_null())?;
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    Some(ProviderError::Upstream(message))
}

/// Map one streamed `data:` payload to events.
pub(crate) fn parse_stream_payload(payload: &str) -> Result<Vec<StreamEvent>, ProviderError> {
    let value = parse_json(payload)?;
    if let Some(err) = upstream_error(&value) {
        return Err(err);
    }

    let mut events = Vec::new();
    if let Some(text) = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            events.push(StreamEvent::Delta(text.to_string()));
        }
    }
    if let Some(usage) = parse_usage(&value) {
        events.push(StreamEvent::Usage(usage));
    }
    Ok(events)
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompatible
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let body = self.body(messages, params, false);
        let (response, _permit) = self.base.send(self.request(&body)).await?;

        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let json = self.base.read_json(response).await?;
        if let Some(err) = upstream_error(&json) {
            return Err(err);
        }

        let content = json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Parse("missing choices[0].message.content".into()))?
            .to_string();
        let request_id = request_id.or_else(|| {
            json.get("id")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        });

        Ok(self
            .base
            .finish_response(content, parse_usage(&json), messages, request_id, started))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream, ProviderError> {
        let body = self.body(messages, params, true);
        let (response, permit) = self.base.send(self.request(&body)).await?;
        Ok(sse_events(
            response,
            permit,
            self.base.timeouts.idle,
            parse_stream_payload,
        ))
    }

    fn close(&self) {
        self.base.close();
    }
}
