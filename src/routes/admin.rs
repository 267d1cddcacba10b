use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::AppError;
use crate::models::policy::{DegradationLevel, Policy, SystemMetrics, Thresholds, ThresholdsUpdate};
use crate::models::provider::ModelEntryInfo;
use crate::models::usage::{DailyUsage, UserTier};
use crate::services::cache::CacheStats;
use crate::services::cost_monitor::CostSummary;
use crate::services::degradation::DegradationStatus;
use crate::services::quota::{QuotaLedger, QuotaRemaining};
use crate::state::AppState;

// ── Degradation ───────────────────────────────────────────────────────

/// GET /admin/degradation: level, override, thresholds and history
async fn degradation_status(State(state): State<Arc<AppState>>) -> Json<DegradationStatus> {
    Json(state.degradation.status())
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    /// null clears the override.
    pub level: Option<DegradationLevel>,
}

/// PUT /admin/degradation/override: pin or release the level
async fn set_override(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OverrideRequest>,
) -> Json<Policy> {
    Json(state.degradation.set_override(body.level))
}

/// PUT /admin/degradation/thresholds: replace one or more threshold rows
async fn set_thresholds(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ThresholdsUpdate>,
) -> Result<Json<Thresholds>, AppError> {
    let rows = [body.hourly_cost, body.error_rate, body.p95_latency_s];
    for row in rows.iter().flatten() {
        if row.windows(2).any(|w| w[0] > w[1]) {
            return Err(AppError::BadRequest(
                "threshold rows must be non-decreasing".into(),
            ));
        }
    }
    Ok(Json(state.degradation.set_thresholds(body)))
}

// ── Metrics & cache ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub hours: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub metrics: SystemMetrics,
    pub summary: CostSummary,
}

/// GET /admin/metrics?hours=24
async fn metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Json<MetricsResponse> {
    let mut metrics = state.monitor.metrics();
    metrics.cache_hit_rate = state.cache.stats().hit_rate;
    let hours = query.hours.unwrap_or(24).clamp(1, 48);
    Json(MetricsResponse {
        metrics,
        summary: state.monitor.summary(hours),
    })
}

/// GET /admin/cache/stats
async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

// ── Provider pool ─────────────────────────────────────────────────────

/// GET /admin/pool: entries with masked credentials
async fn list_pool(State(state): State<Arc<AppState>>) -> Json<Vec<ModelEntryInfo>> {
    Json(state.pool.list())
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub entries: usize,
}

/// POST /admin/pool/reload: re-read PROVIDER_POOL_FILE
async fn reload_pool(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, AppError> {
    let entries = state
        .pool
        .reload()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(ReloadResponse { entries }))
}

// ── Quota ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    pub tier: UserTier,
    pub usage: DailyUsage,
    pub remaining: QuotaRemaining,
}

/// GET /admin/quota/{user_id}: today's usage for a user
async fn user_quota(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<QuotaResponse> {
    let tier = state.quota.tier_for(&user_id, None);
    let decision = state.quota.check_quota(&user_id, tier);
    Json(QuotaResponse {
        tier,
        usage: state.quota.usage_on(&user_id, QuotaLedger::today()),
        remaining: decision.remaining,
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Degradation
        .route("/degradation", get(degradation_status))
        .route("/degradation/override", put(set_override))
        .route("/degradation/thresholds", put(set_thresholds))
        // Observability
        .route("/metrics", get(metrics))
        .route("/cache/stats", get(cache_stats))
        // Pool
        .route("/pool", get(list_pool))
        .route("/pool/reload", post(reload_pool))
        // Quota
        .route("/quota/{user_id}", get(user_quota))
}
