pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::OwnedSemaphorePermit;

use super::http_pool::{HttpClientPool, PooledClient};
use super::token_counter;
use crate::models::chat::{ChatMessage, ChatParams, ChatResponse, StreamEvent, TokenUsage};
use crate::models::provider::{ModelEntry, ProviderKind};

const MAX_ERROR_BODY: usize = 512;

/// A stream of upstream events. It ends on normal completion or yields a
/// terminal `Err`.
pub type ChunkStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("timed out during {0}")]
    Timeout(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("upstream returned no content")]
    EmptyResponse,

    #[error("upstream reported an error: {0}")]
    Upstream(String),

    #[error("adapter configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout(_))
    }

    fn transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Speaks one upstream's wire protocol.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatResponse, ProviderError>;

    /// Open a streamed completion. Errors returned here (or as the first
    /// stream item) happen before any chunk reached the client.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream, ProviderError>;

    /// Release resources. Called when the adapter leaves the cache.
    fn close(&self) {}
}

/// Builds the adapter for a pool entry.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, entry: &ModelEntry) -> Result<Arc<dyn ProviderAdapter>, ProviderError>;
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterTimeouts {
    /// Budget for connecting and receiving response headers.
    pub open: Duration,
    /// Maximum silence between two body chunks.
    pub idle: Duration,
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(60),
            idle: Duration::from_secs(30),
        }
    }
}

/// Dispatch table from provider kind to the HTTP adapter implementation.
pub struct HttpAdapterFactory {
    http: Arc<HttpClientPool>,
    timeouts: AdapterTimeouts,
}

impl HttpAdapterFactory {
    pub fn new(http: Arc<HttpClientPool>, timeouts: AdapterTimeouts) -> Self {
        Self { http, timeouts }
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn create(&self, entry: &ModelEntry) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let client = self.http.client_for(&entry.resolved_base_url())?;
        let base = AdapterBase::new(entry.clone(), client, self.timeouts);
        Ok(match entry.kind() {
            ProviderKind::OpenAiCompatible => Arc::new(openai::OpenAiAdapter::new(base)),
            ProviderKind::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(base)),
            ProviderKind::Gemini => Arc::new(gemini::GeminiAdapter::new(base)),
        })
    }
}

/// State every HTTP adapter carries.
pub struct AdapterBase {
    pub entry: ModelEntry,
    pub client: PooledClient,
    pub timeouts: AdapterTimeouts,
    closed: AtomicBool,
}

impl AdapterBase {
    pub fn new(entry: ModelEntry, client: PooledClient, timeouts: AdapterTimeouts) -> Self {
        Self {
            entry,
            client,
            timeouts,
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::Config(format!(
                "adapter for {} was closed",
                self.entry.name
            )));
        }
        Ok(())
    }

    /// Send the request under a connection permit, enforcing the open timeout
    /// and mapping non-2xx statuses to errors.
    pub async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(reqwest::Response, OwnedSemaphorePermit), ProviderError> {
        self.ensure_open()?;
        let permit = self.client.acquire().await?;

        let response = tokio::time::timeout(self.timeouts.open, request.send())
            .await
            .map_err(|_| ProviderError::Timeout("upstream open".into()))?
            .map_err(ProviderError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".into());
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        Ok((response, permit))
    }

    /// Read a non-streaming JSON body within the open budget.
    pub async fn read_json(
        &self,
        response: reqwest::Response,
    ) -> Result<serde_json::Value, ProviderError> {
        tokio::time::timeout(self.timeouts.open, response.json::<serde_json::Value>())
            .await
            .map_err(|_| ProviderError::Timeout("response body".into()))?
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }

    /// Merge entry extras and request extras into a JSON body; request wins.
    pub fn merge_extras(&self, body: &mut serde_json::Value, params: &ChatParams) {
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in self.entry.extra_params() {
                obj.entry(k).or_insert(v);
            }
            for (k, v) in &params.extra {
                obj.insert(k.clone(), v.clone());
            }
        }
    }
}

impl AdapterBase {
    /// Assemble the non-streaming result, estimating tokens when the upstream
    /// did not report usage.
    pub fn finish_response(
        &self,
        content: String,
        usage: Option<TokenUsage>,
        messages: &[ChatMessage],
        request_id: Option<String>,
        started: Instant,
    ) -> ChatResponse {
        let (tokens_used, tokens_estimated) = match usage {
            Some(u) => (u.total(), false),
            None => (
                token_counter::estimate_messages(messages) + token_counter::estimate_tokens(&content),
                true,
            ),
        };
        let cost = if self.entry.cost_per_1k_tokens > 0.0 {
            Some(tokens_used as f64 / 1000.0 * self.entry.cost_per_1k_tokens)
        } else {
            None
        };

        ChatResponse {
            content,
            model: self.entry.model_id().to_string(),
            provider: self.entry.kind().as_str().to_string(),
            tokens_used: Some(tokens_used),
            tokens_estimated,
            cost,
            response_time_ms: started.elapsed().as_millis() as u64,
            request_id,
        }
    }
}

/// Parse a JSON payload, mapping failures to `Parse`.
pub fn parse_json(payload: &str) -> Result<serde_json::Value, ProviderError> {
    serde_json::from_str(payload)
        .map_err(|e| ProviderError::Parse(format!("{e}; payload={}", truncate(payload, 200))))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

/// Incremental `text/event-stream` decoder. Collects `data:` lines and emits
/// one payload per blank-line-terminated event.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.feed_line(line.trim_end_matches(['\r', '\n']), &mut out);
        }
        out
    }

    /// Flush whatever is left once the byte stream ends.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest).to_string();
            for line in rest.lines() {
                self.feed_line(line, &mut out);
            }
        }
        if !self.data.is_empty() {
            out.push(self.data.drain(..).collect::<Vec<_>>().join("\n"));
        }
        out
    }

    fn feed_line(&mut self, line: &str, out: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                out.push(self.data.drain(..).collect::<Vec<_>>().join("\n"));
            }
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.trim_start().to_string());
        }
    }
}

/// Turn an SSE response into events. `parse` maps one `data:` payload to zero
/// or more events; the permit is held until the stream is dropped.
pub fn sse_events<F>(
    response: reqwest::Response,
    permit: OwnedSemaphorePermit,
    idle: Duration,
    mut parse: F,
) -> ChunkStream
where
    F: FnMut(&str) -> Result<Vec<StreamEvent>, ProviderError> + Send + 'static,
{
    let stream = async_stream::try_stream! {
        let _permit = permit;
        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        loop {
            let next = tokio::time::timeout(idle, bytes.next())
                .await
                .map_err(|_| ProviderError::Timeout("stream read".into()))?;

            let ended = next.is_none();
            let payloads = match next {
                Some(chunk) => decoder.push(&chunk.map_err(ProviderError::transport)?),
                None => decoder.finish(),
            };

            for payload in payloads {
                if payload == "[DONE]" {
                    continue;
                }
                for event in parse(&payload)? {
                    yield event;
                }
            }

            if ended {
                break;
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_lines_and_multibyte_chars() {
        let mut decoder = SseDecoder::default();
        let raw = "data: {\"t\":\"你好\"}\n\ndata: [DONE]\n\n".as_bytes();
        // split inside the multi-byte sequence of the first CJK character
        let (a, b) = raw.split_at(14);
        let mut out = decoder.push(a);
        assert!(out.is_empty());
        out.extend(decoder.push(b));
        assert_eq!(out, vec!["{\"t\":\"你好\"}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn decoder_ignores_event_and_comment_lines() {
        let mut decoder = SseDecoder::default();
        let out = decoder.push(b": ping\r\nevent: message_start\r\ndata: {}\r\n\r\n");
        assert_eq!(out, vec!["{}".to_string()]);
    }

    #[test]
    fn decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), vec!["tail".to_string()]);
    }

    #[test]
    fn truncates_long_error_bodies() {
        let long = "x".repeat(600);
        assert_eq!(truncate(&long, 512).len(), 515);
        assert_eq!(truncate("short", 512), "short");
    }
}
