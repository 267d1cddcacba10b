use bytes::Bytes;
use serde::Serialize;
use serde_json::json;

use crate::error::catalog_message;
use crate::models::divination::Language;
use crate::services::adapters::ProviderError;

/// In-band error codes carried by a terminal error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SseErrorCode {
    StreamError,
    TimeoutError,
    ProviderError,
    RateLimitError,
    AuthError,
    Cancelled,
    UnknownError,
}

impl SseErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SseErrorCode::StreamError => "STREAM_ERROR",
            SseErrorCode::TimeoutError => "TIMEOUT_ERROR",
            SseErrorCode::ProviderError => "PROVIDER_ERROR",
            SseErrorCode::RateLimitError => "RATE_LIMIT_ERROR",
            SseErrorCode::AuthError => "AUTH_ERROR",
            SseErrorCode::Cancelled => "CANCELLED",
            SseErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Code for an upstream failure after the stream was committed.
    pub fn for_stream_failure(err: &ProviderError) -> Self {
        if err.is_timeout() {
            SseErrorCode::TimeoutError
        } else {
            SseErrorCode::StreamError
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Content(String),
    Error { code: SseErrorCode, message: String },
    Done,
}

impl SseEvent {
    /// Error event with the catalog message for `code`.
    pub fn error(code: SseErrorCode, lang: Language) -> Self {
        SseEvent::Error {
            code,
            message: catalog_message(code.as_str(), lang).to_string(),
        }
    }

    /// `data: <payload>\n\n`. Content is a JSON string, errors a JSON object,
    /// and the terminator is the literal `[DONE]`.
    pub fn encode(&self) -> Bytes {
        let payload = match self {
            SseEvent::Content(text) => serde_json::Value::String(text.clone()).to_string(),
            SseEvent::Error { code, message } => json!({
                "type": "error",
                "code": code.as_str(),
                "message": message,
            })
            .to_string(),
            SseEvent::Done => "[DONE]".to_string(),
        };
        Bytes::from(format!("data: {}\n\n", payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_a_json_string() {
        assert_eq!(
            SseEvent::Content("你好\n\"x\"".into()).encode(),
            Bytes::from("data: \"你好\\n\\\"x\\\"\"\n\n")
        );
        assert_eq!(SseEvent::Done.encode(), Bytes::from("data: [DONE]\n\n"));
    }

    #[test]
    fn errors_are_json_objects() {
        let raw = SseEvent::Error {
            code: SseErrorCode::StreamError,
            message: "oops".into(),
        }
        .encode();
        let text = std::str::from_utf8(&raw).unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(payload["type"], "error");
        assert_eq!(payload["code"], "STREAM_ERROR");
        assert_eq!(payload["message"], "oops");
    }

    #[test]
    fn post_commit_failures_map_to_codes() {
        assert_eq!(
            SseErrorCode::for_stream_failure(&ProviderError::Timeout("idle".into())),
            SseErrorCode::TimeoutError
        );
        assert_eq!(
            SseErrorCode::for_stream_failure(&ProviderError::Transport("reset".into())),
            SseErrorCode::StreamError
        );
        assert_eq!(
            serde_json::to_value(SseErrorCode::RateLimitError).unwrap(),
            "RATE_LIMIT_ERROR"
        );
    }
}
