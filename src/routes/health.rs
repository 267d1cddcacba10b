use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let policy = state.degradation.snapshot();
    Json(json!({
        "status": "ok",
        "degradation_level": policy.level.as_str(),
        "active_requests": state.monitor.active_requests(),
        "providers_available": state.pool.has_active(),
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::DegradationLevel;
    use crate::services::testing::ScriptedFactory;
    use crate::state::test_support;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn reports_degradation_level() {
        let state = test_support::state(ScriptedFactory::new(), &[], &[]);
        state.degradation.set_override(Some(DegradationLevel::Moderate));

        let response = router()
            .with_state(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["degradation_level"], "moderate");
        assert_eq!(body["providers_available"], false);
    }
}
