use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::error::AppError;
use crate::middleware::client_ip::client_origin;
use crate::models::identity::{Claims, Identity};
use crate::models::usage::UserTier;
use crate::state::AppState;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Middleware that validates the Admin Key from env config.
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = match (&state.config.admin_key, extract_bearer(&req)) {
        (Some(expected), Some(token)) => constant_time_eq(expected.as_bytes(), token.as_bytes()),
        _ => false,
    };
    if !authorized {
        tracing::warn!("Rejected admin request to {}", req.uri().path());
        return AppError::Unauthorized.into_response();
    }
    next.run(req).await
}

/// Resolve who is calling and from where, and stash both in the request
/// extensions. A missing token means anonymous; a bad one is rejected.
pub async fn resolve_identity(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let origin = client_origin(
        req.extensions().get::<ConnectInfo<SocketAddr>>(),
        req.headers(),
        &state.config.trusted_proxies,
    );

    let identity = match extract_bearer(&req) {
        None => Identity::anonymous(origin.ip),
        Some(token) => {
            let Some(secret) = state.config.jwt_secret.as_deref() else {
                tracing::warn!("Bearer token received but JWT_SECRET is not configured");
                return AppError::Unauthorized.into_response();
            };
            match verify_token(token, secret) {
                Ok(claims) => Identity::user(
                    &claims.login_type,
                    &claims.user_name,
                    claims.tier.as_deref().and_then(UserTier::from_str),
                    origin.ip,
                ),
                Err(e) => {
                    tracing::debug!("Invalid bearer token: {}", e);
                    return AppError::Unauthorized.into_response();
                }
            }
        }
    };

    req.extensions_mut().insert(identity);
    req.extensions_mut().insert(origin);
    next.run(req).await
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &key, &validation).map(|data| data.claims)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "f3a9c1d27e5b48a0b6c2e9d4f1a7b3c5";

    fn token(exp_offset: i64, secret: &str) -> String {
        let claims = Claims {
            sub: "42".into(),
            login_type: "gh".into(),
            user_name: "alice".into(),
            tier: Some("vip".into()),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips_claims() {
        let claims = verify_token(&token(3600, SECRET), SECRET).unwrap();
        assert_eq!(claims.login_type, "gh");
        assert_eq!(claims.user_name, "alice");
        assert_eq!(claims.tier.as_deref(), Some("vip"));
    }

    #[test]
    fn expired_or_foreign_tokens_fail() {
        assert!(verify_token(&token(-3600, SECRET), SECRET).is_err());
        assert!(verify_token(&token(3600, "another-secret-another-secret-xx"), SECRET).is_err());
        assert!(verify_token("not.a.jwt", SECRET).is_err());
    }

    #[test]
    fn admin_key_comparison() {
        assert!(constant_time_eq(b"admin-key", b"admin-key"));
        assert!(!constant_time_eq(b"admin-key", b"admin-kez"));
        assert!(!constant_time_eq(b"admin", b"admin-key"));
    }
}
