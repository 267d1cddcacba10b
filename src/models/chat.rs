use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters shared by every dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatParams {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Provider-neutral extras merged into the upstream body.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            extra: Map::new(),
        }
    }
}

impl ChatParams {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Non-streaming completion result.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub tokens_used: Option<u32>,
    pub tokens_estimated: bool,
    pub cost: Option<f64>,
    pub response_time_ms: u64,
    pub request_id: Option<String>,
}

/// One item of an upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A UTF-8 text fragment to forward downstream.
    Delta(String),
    /// Usage reported by the upstream, typically near the end.
    Usage(TokenUsage),
}
