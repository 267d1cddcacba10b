use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::models::divination::Language;
use crate::services::cache::CacheError;

/// Errors raised while the request is still being admitted, plus the few
/// internal failures that can surface before the stream starts.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unknown divination type: {0}")]
    InvalidDivinationType(String),

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Prompt exceeds {max} characters")]
    InputTooLong { max: usize },

    #[error("Prompt contains a blocked word")]
    StopWordDetected,

    #[error("Rate limit exceeded for {0}")]
    RateLimitExceeded(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Service busy")]
    ServiceBusy,

    #[error("Invalid API key format: {0}")]
    InvalidApiKeyFormat(String),

    #[error("Custom upstream requires HTTPS")]
    InsecureTransport,

    #[error("No model allowed for tier {0}")]
    ModelNotAllowed(String),

    #[error("No providers configured")]
    NoProvidersConfigured,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl AppError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidDivinationType(_) => "INVALID_DIVINATION_TYPE",
            AppError::EmptyPrompt => "EMPTY_PROMPT",
            AppError::InputTooLong { .. } => "INPUT_TOO_LONG",
            AppError::StopWordDetected => "STOP_WORD_DETECTED",
            AppError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            AppError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            AppError::ServiceBusy => "SERVICE_BUSY",
            AppError::InvalidApiKeyFormat(_) => "INVALID_API_KEY_FORMAT",
            AppError::InsecureTransport => "INSECURE_TRANSPORT",
            AppError::ModelNotAllowed(_) => "MODEL_NOT_ALLOWED",
            AppError::NoProvidersConfigured => "NO_PROVIDERS_CONFIGURED",
            AppError::Unauthorized => "AUTH_ERROR",
            AppError::NotFound => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Internal(_) | AppError::Cache(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidDivinationType(_)
            | AppError::EmptyPrompt
            | AppError::InputTooLong { .. }
            | AppError::StopWordDetected
            | AppError::InvalidApiKeyFormat(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::InsecureTransport | AppError::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::RateLimitExceeded(_) | AppError::QuotaExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::ServiceBusy | AppError::NoProvidersConfigured => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Internal(_) | AppError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build the JSON error response with a message from the localized catalog.
    /// Internal details are logged, never returned.
    pub fn into_localized_response(self, lang: Language) -> Response {
        match &self {
            AppError::Internal(msg) => tracing::error!("Internal error: {}", msg),
            AppError::Cache(e) => tracing::error!("Cache error: {}", e),
            other => tracing::debug!("Request rejected: {}", other),
        }

        let code = self.code();
        let body = Json(json!({
            "error": { "code": code, "message": catalog_message(code, lang) }
        }));
        (self.status(), body).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_localized_response(Language::default())
    }
}

/// Errors that abort process start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("JWT_SECRET is missing or weak: {0}")]
    WeakJwtSecret(String),

    #[error("No active upstream provider is configured")]
    NoProvidersConfigured,

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// User-facing message for an error code. Unknown codes map to the generic
/// message so upstream details never leak.
pub fn catalog_message(code: &str, lang: Language) -> &'static str {
    match lang {
        Language::Zh => match code {
            "INVALID_DIVINATION_TYPE" => "不支持的占卜类型",
            "EMPTY_PROMPT" => "请输入您想问的问题",
            "INPUT_TOO_LONG" => "输入内容过长，请精简后再试",
            "STOP_WORD_DETECTED" => "输入内容包含不允许的词语",
            "RATE_LIMIT_EXCEEDED" | "RATE_LIMIT_ERROR" => "请求过于频繁，请稍后再试",
            "QUOTA_EXCEEDED" => "今日使用次数已达上限，请明天再来",
            "SERVICE_BUSY" => "服务繁忙，请稍后再试",
            "INVALID_API_KEY_FORMAT" => "API 密钥格式无效",
            "INSECURE_TRANSPORT" => "自定义密钥必须通过 HTTPS 传输",
            "MODEL_NOT_ALLOWED" => "当前会员等级无法使用该模型",
            "NO_PROVIDERS_CONFIGURED" => "暂无可用的模型服务",
            "AUTH_ERROR" => "身份验证失败，请重新登录",
            "NOT_FOUND" => "资源不存在",
            "BAD_REQUEST" => "请求格式错误",
            "STREAM_ERROR" => "生成过程中断，请重试",
            "TIMEOUT_ERROR" => "响应超时，请重试",
            "PROVIDER_ERROR" => "模型服务暂时不可用，请稍后再试",
            "CANCELLED" => "请求已取消",
            _ => "服务器内部错误，请稍后再试",
        },
        Language::En => match code {
            "INVALID_DIVINATION_TYPE" => "Unsupported divination type",
            "EMPTY_PROMPT" => "Please enter your question",
            "INPUT_TOO_LONG" => "Your input is too long, please shorten it",
            "STOP_WORD_DETECTED" => "Your input contains a blocked word",
            "RATE_LIMIT_EXCEEDED" | "RATE_LIMIT_ERROR" => {
                "Too many requests, please try again later"
            }
            "QUOTA_EXCEEDED" => "Daily quota reached, please come back tomorrow",
            "SERVICE_BUSY" => "Service is busy, please try again later",
            "INVALID_API_KEY_FORMAT" => "Invalid API key format",
            "INSECURE_TRANSPORT" => "Custom API keys must be sent over HTTPS",
            "MODEL_NOT_ALLOWED" => "Your membership tier cannot use this model",
            "NO_PROVIDERS_CONFIGURED" => "No model service is available",
            "AUTH_ERROR" => "Authentication failed, please sign in again",
            "NOT_FOUND" => "Not found",
            "BAD_REQUEST" => "Malformed request",
            "STREAM_ERROR" => "Generation was interrupted, please retry",
            "TIMEOUT_ERROR" => "The response timed out, please retry",
            "PROVIDER_ERROR" => "Model service temporarily unavailable",
            "CANCELLED" => "Request cancelled",
            _ => "Internal server error, please try again later",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_map_to_expected_status() {
        assert_eq!(
            AppError::RateLimitExceeded("ip:1.2.3.4".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(AppError::ServiceBusy.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(AppError::InsecureTransport.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Unauthorized.code(), "AUTH_ERROR");
    }

    #[test]
    fn catalog_never_echoes_unknown_codes() {
        let msg = catalog_message("sk-secret-upstream-detail", Language::En);
        assert_eq!(msg, "Internal server error, please try again later");
        assert_eq!(catalog_message("QUOTA_EXCEEDED", Language::Zh), "今日使用次数已达上限，请明天再来");
    }
}
