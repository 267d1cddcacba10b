use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderName},
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::AppError;
use crate::middleware::client_ip::ClientOrigin;
use crate::models::divination::{DivinationRequest, Language};
use crate::models::identity::Identity;
use crate::services::coordinator::{CustomUpstream, RequestContext};
use crate::state::AppState;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `x-api-key` switches the request onto the caller's own upstream.
fn custom_upstream(headers: &HeaderMap) -> Option<CustomUpstream> {
    Some(CustomUpstream {
        api_key: header_str(headers, "x-api-key")?,
        base_url: header_str(headers, "x-api-url"),
        model: header_str(headers, "x-api-model"),
    })
}

/// POST /divination: stream a reading as server-sent events
async fn divination(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Extension(origin): Extension<ClientOrigin>,
    headers: HeaderMap,
    payload: Result<Json<DivinationRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return AppError::BadRequest(rejection.body_text()).into_localized_response(Language::Zh)
        }
    };
    let language = request.language();

    let ctx = RequestContext {
        identity,
        custom: custom_upstream(&headers),
        https: origin.https,
    };

    let rx = match state.coordinator.handle(request, ctx).await {
        Ok(rx) => rx,
        Err(e) => return e.into_localized_response(language),
    };

    let body = Body::from_stream(
        ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.encode())),
    );
    (
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        body,
    )
        .into_response()
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/divination", post(divination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::auth::resolve_identity;
    use crate::services::adapters::ProviderError;
    use crate::services::testing::{Script, ScriptedFactory, Step};
    use crate::state::test_support;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(state: Arc<AppState>) -> Router {
        router()
            .route_layer(axum::middleware::from_fn_with_state(state.clone(), resolve_identity))
            .with_state(state)
    }

    fn post_json(body: Value) -> Request<Body> {
        Request::post("/divination")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn streams_sse_frames() {
        let state = test_support::state(
            ScriptedFactory::new()
                .with("a", Script::Stream(vec![Step::Text("你好"), Step::Text("，"), Step::Text("世界")])),
            &["a"],
            &[],
        );
        let response = app(state)
            .oneshot(post_json(json!({ "prompt_type": "xiaoliu", "prompt": "问事业" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream; charset=utf-8"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");
        assert_eq!(
            body_text(response).await,
            "data: \"你好\"\n\ndata: \"，\"\n\ndata: \"世界\"\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn stream_errors_stay_in_band() {
        let state = test_support::state(
            ScriptedFactory::new().with(
                "a",
                Script::Stream(vec![
                    Step::Text("部"),
                    Step::Fail(ProviderError::Transport("connection reset".into())),
                ]),
            ),
            &["a"],
            &[],
        );
        let response = app(state)
            .oneshot(post_json(json!({ "prompt_type": "tarot", "prompt": "感情", "language": "en" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], "data: \"部\"");
        let error: Value = serde_json::from_str(frames[1].trim_start_matches("data: ")).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "STREAM_ERROR");
        assert_eq!(error["message"], "Generation was interrupted, please retry");
        assert_eq!(frames[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn anonymous_rate_limit_returns_429() {
        let state = test_support::state(
            ScriptedFactory::new().with("a", Script::Stream(vec![Step::Text("ok")])),
            &["a"],
            &[("RATE_LIMIT_ANON", "3"), ("QUOTA_FREE_DAILY_CALLS", "-1")],
        );
        let app = app(state);
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(post_json(json!({ "prompt_type": "tarot", "prompt": "x" })))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            body_text(response).await;
        }
        let response = app
            .oneshot(post_json(json!({ "prompt_type": "tarot", "prompt": "x" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["error"]["message"], "请求过于频繁，请稍后再试");
    }

    #[tokio::test]
    async fn admission_errors_use_the_request_language() {
        let state = test_support::state(ScriptedFactory::new(), &[], &[]);
        let response = app(state.clone())
            .oneshot(post_json(json!({ "prompt_type": "palmistry", "prompt": "x", "language": "en-US" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], "INVALID_DIVINATION_TYPE");
        assert_eq!(body["error"]["message"], "Unsupported divination type");

        let response = app(state)
            .oneshot(
                Request::post("/divination")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_bearer_token_is_rejected() {
        let state = test_support::state(
            ScriptedFactory::new(),
            &[],
            &[("JWT_SECRET", "f3a9c1d27e5b48a0b6c2e9d4f1a7b3c5")],
        );
        let request = Request::post("/divination")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer forged.token.value")
            .body(Body::from(json!({ "prompt_type": "tarot", "prompt": "x" }).to_string()))
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], "AUTH_ERROR");
    }

    #[test]
    fn custom_upstream_requires_a_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-url", "https://api.example.com/v1".parse().unwrap());
        assert!(custom_upstream(&headers).is_none());

        headers.insert("x-api-key", "sk-abcdefghijklmnopqrstuv".parse().unwrap());
        let custom = custom_upstream(&headers).unwrap();
        assert_eq!(custom.base_url.as_deref(), Some("https://api.example.com/v1"));
        assert!(custom.model.is_none());
    }
}
