use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::AppError;
use crate::models::identity::Identity;
use crate::services::cache::{CacheClient, RateDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateProfile {
    pub max: u64,
    pub window: Duration,
}

/// Sliding-window limiter over the shared cache client. Anonymous callers are
/// keyed by IP, authenticated callers by `login_type:user_name`.
pub struct RateLimiter {
    cache: Arc<dyn CacheClient>,
    anonymous: RateProfile,
    authenticated: RateProfile,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheClient>, anonymous: RateProfile, authenticated: RateProfile) -> Self {
        Self {
            cache,
            anonymous,
            authenticated,
        }
    }

    pub fn profile_for(&self, identity: &Identity) -> RateProfile {
        if identity.authenticated {
            self.authenticated
        } else {
            self.anonymous
        }
    }

    pub async fn check(&self, identity: &Identity) -> Result<RateDecision, AppError> {
        self.check_at(identity, Utc::now().timestamp_millis()).await
    }

    pub async fn check_at(&self, identity: &Identity, now_ms: i64) -> Result<RateDecision, AppError> {
        let profile = self.profile_for(identity);
        let key = window_key(identity);

        let decision = match self
            .cache
            .rate_limit_check(&key, profile.window, profile.max, now_ms)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                // A broken shared store must not take the broker down with it.
                tracing::warn!("Rate limit check failed, admitting request: {}", e);
                return Ok(RateDecision {
                    allowed: true,
                    count: 0,
                });
            }
        };

        if !decision.allowed {
            tracing::info!(
                "Rate limited {} ({} calls in {}s)",
                identity.user_id,
                decision.count,
                profile.window.as_secs()
            );
            return Err(AppError::RateLimitExceeded(format!(
                "{} requests per {}s",
                profile.max,
                profile.window.as_secs()
            )));
        }
        Ok(decision)
    }
}

fn window_key(identity: &Identity) -> String {
    if identity.authenticated {
        format!("ratelimit:user:{}", identity.user_id)
    } else {
        format!("ratelimit:ip:{}", identity.ip)
    }
}
