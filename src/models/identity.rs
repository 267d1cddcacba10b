use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::usage::UserTier;

/// Who is calling, as resolved by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// `login_type:user_name` when authenticated, `ip:<addr>` otherwise.
    pub user_id: String,
    pub authenticated: bool,
    /// Tier asserted by the token, if any.
    pub tier: Option<UserTier>,
    pub ip: IpAddr,
}

impl Identity {
    pub fn anonymous(ip: IpAddr) -> Self {
        Self {
            user_id: format!("ip:{}", ip),
            authenticated: false,
            tier: None,
            ip,
        }
    }

    pub fn user(login_type: &str, user_name: &str, tier: Option<UserTier>, ip: IpAddr) -> Self {
        Self {
            user_id: format!("{}:{}", login_type, user_name),
            authenticated: true,
            tier,
            ip,
        }
    }
}

/// JWT claims issued by the login service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub login_type: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    pub exp: usize,
}
