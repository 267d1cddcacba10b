use std::time::Instant;

use async_trait::async_trait;
use reqwest::header;
use serde_json::{json, Value};

use super::{parse_json, sse_events, AdapterBase, ChunkStream, ProviderAdapter, ProviderError};
use crate::models::chat::{ChatMessage, ChatParams, ChatResponse, Role, StreamEvent, TokenUsage};
use crate::models::provider::ProviderKind;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API. The system prompt travels as a top-level field.
pub struct AnthropicAdapter {
    base: AdapterBase,
}

impl AnthropicAdapter {
    pub fn new(base: AdapterBase) -> Self {
        Self { base }
    }

    fn url(&self) -> String {
        let base = self.base.entry.resolved_base_url();
        if base.ends_with("/v1") {
            format!("{base}/messages")
        } else {
            format!("{base}/v1/messages")
        }
    }

    fn body(&self, messages: &[ChatMessage], params: &ChatParams, stream: bool) -> Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.base.entry.model_id(),
            "messages": turns,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system.join("\n\n"));
        }
        self.base.merge_extras(&mut body, params);
        body
    }

    fn request(&self, body: &Value, stream: bool) -> reqwest::RequestBuilder {
        let mut req = self
            .base
            .client
            .client
            .post(self.url())
            .header("x-api-key", &self.base.entry.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if stream {
            req = req.header(header::ACCEPT, "text/event-stream");
        }
        req
    }
}

fn error_message(value: &Value) -> Option<String> {
    if value.get("type").and_then(Value::as_str) != Some("error") {
        return None;
    }
    Some(
        value
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    )
}

/// Stateful parser: `message_start` carries input tokens, `message_delta`
/// carries the running output count.
pub(crate) fn stream_parser() -> impl FnMut(&str) -> Result<Vec<StreamEvent>, ProviderError> + Send
{
    let mut input_tokens = 0u32;
    move |payload: &str| {
        let value = parse_json(payload)?;
        if let Some(msg) = error_message(&value) {
            return Err(ProviderError::Upstream(msg));
        }

        let mut events = Vec::new();
        match value.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                input_tokens = value
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
            }
            Some("content_block_delta") => {
                if let Some(text) = value.pointer("/delta/text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(StreamEvent::Delta(text.to_string()));
                    }
                }
            }
            Some("message_delta") => {
                if let Some(out) = value
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    events.push(StreamEvent::Usage(TokenUsage {
                        input_tokens,
                        output_tokens: out as u32,
                    }));
                }
            }
            _ => {}
        }
        Ok(events)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let body = self.body(messages, params, false);
        let (response, _permit) = self.base.send(self.request(&body, false)).await?;
        let json = self.base.read_json(response).await?;
        if let Some(msg) = error_message(&json) {
            return Err(ProviderError::Upstream(msg));
        }

        let blocks = json
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Parse("missing content array".into()))?;
        let content: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();

        let usage = json.get("usage").map(|u| TokenUsage {
            input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        });
        let request_id = json.get("id").and_then(Value::as_str).map(str::to_string);

        Ok(self
            .base
            .finish_response(content, usage, messages, request_id, started))
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream, ProviderError> {
        let body = self.body(messages, params, true);
        let (response, permit) = self.base.send(self.request(&body, true)).await?;
        Ok(sse_events(
            response,
            permit,
            self.base.timeouts.idle,
            stream_parser(),
        ))
    }

    fn close(&self) {
        self.base.close();
    }
}
