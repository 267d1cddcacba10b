use std::time::Instant;

use async_trait::async_trait;
use reqwest::header;
use serde_json::{json, Value};

use super::{parse_json, sse_events, AdapterBase, ChunkStream, ProviderAdapter, ProviderError};
use crate::models::chat::{ChatMessage, ChatParams, ChatResponse, StreamEvent, TokenUsage};
use crate::models::provider::ProviderKind;

/// Gemini `generateContent`. The whole conversation is flattened into one
/// user turn with the system prompt prepended.
pub struct GeminiAdapter {
    base: AdapterBase,
}

impl GeminiAdapter {
    pub fn new(base: AdapterBase) -> Self {
        Self { base }
    }

    fn url(&self, stream: bool) -> String {
        let base = self.base.entry.resolved_base_url();
        let model = self.base.entry.model_id();
        if stream {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/models/{model}:generateContent")
        }
    }

    fn body(&self, messages: &[ChatMessage], params: &ChatParams) -> Value {
        let mut generation = json!({
            "temperature": params.temperature,
            "maxOutputTokens": params.max_tokens,
        });
        if let Some(cfg) = generation.as_object_mut() {
            for (k, v) in self.base.entry.extra_params() {
                cfg.entry(k).or_insert(v);
            }
            for (k, v) in &params.extra {
                cfg.insert(k.clone(), v.clone());
            }
        }

        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": flatten(messages) }]
            }],
            "generationConfig": generation,
        })
    }

    fn request(&self, body: &Value, stream: bool) -> reqwest::RequestBuilder {
        self.base
            .client
            .client
            .post(self.url(stream))
            .header("x-goog-api-key", &self.base.entry.api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
    }
}

/// System text first, then every other turn in order.
pub(crate) fn flatten(messages: &[ChatMessage]) -> String {
    let (system, rest): (Vec<&ChatMessage>, Vec<&ChatMessage>) = messages
        .iter()
        .partition(|m| m.role == crate::models::chat::Role::System);
    system
        .iter()
        .chain(rest.iter())
        .map(|m| m.content.as_str())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn candidate_text(value: &Value) -> String {
    value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

fn usage(value: &Value) -> Option<TokenUsage> {
    let meta = value.get("usageMetadata")?;
    Some(TokenUsage {
        input_tokens: meta
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        output_tokens: meta
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    })
}

fn upstream_error(value: &Value) -> Option<ProviderError> {
    let err = value.get("error")?;
    Some(ProviderError::Upstream(
        err.get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    ))
}

pub(crate) fn parse_stream_payload(payload: &str) -> Result<Vec<StreamEvent>, ProviderError> {
    let value = parse_json(payload)?;
    if let Some(err) = upstream_error(&value) {
        return Err(err);
    }
    let mut events = Vec::new();
    let text = candidate_text(&value);
    if !text.is_empty() {
        events.push(StreamEvent::Delta(text));
    }
    if let Some(u) = usage(&value) {
        events.push(StreamEvent::Usage(u));
    }
    Ok(events)
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let body = self.body(messages, params);
        let (response, _permit) = self.base.send(self.request(&body, false)).await?;
        let json = self.base.read_json(response).await?;
        if let Some(err) = upstream_error(&json) {
            return Err(err);
        }
        if json.pointer("/candidates/0").is_none() {
            return Err(ProviderError::Parse("missing candidates".into()));
        }

        let content = candidate_text(&json);
        let request_id = json
            .get("responseId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(self
            .base
            .finish_response(content, usage(&json), messages, request_id, started))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream, ProviderError> {
        let body = self.body(messages, params);
        let (response, permit) = self.base.send(self.request(&body, true)).await?;
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
