use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One finished request as seen by the cost monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub ts: DateTime<Utc>,
    pub model: String,
    pub in_tokens: u32,
    pub out_tokens: u32,
    pub cost: f64,
    pub latency_s: f64,
    pub success: bool,
    pub tool_name: String,
    pub user_id: String,
    /// Number of upstream candidates tried for this request.
    #[serde(default = "one")]
    pub attempts: u32,
}

fn one() -> u32 {
    1
}

/// A user's counters for one calendar day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyUsage {
    pub user_id: String,
    pub date: NaiveDate,
    pub call_count: u64,
    pub token_count: u64,
    pub cost: f64,
    pub last_call_ts: Option<DateTime<Utc>>,
}

impl DailyUsage {
    pub fn empty(user_id: &str, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_string(),
            date,
            call_count: 0,
            token_count: 0,
            cost: 0.0,
            last_call_ts: None,
        }
    }

    /// Ledger key: `user_id:YYYY-MM-DD`.
    pub fn key(user_id: &str, date: NaiveDate) -> String {
        format!("{}:{}", user_id, date.format("%Y-%m-%d"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    #[default]
    Free,
    Vip,
    Premium,
    Unlimited,
}

impl UserTier {
    pub const ALL: [UserTier; 4] = [
        UserTier::Free,
        UserTier::Vip,
        UserTier::Premium,
        UserTier::Unlimited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserTier::Free => "free",
            UserTier::Vip => "vip",
            UserTier::Premium => "premium",
            UserTier::Unlimited => "unlimited",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "free" => Some(UserTier::Free),
            "vip" => Some(UserTier::Vip),
            "premium" => Some(UserTier::Premium),
            "unlimited" => Some(UserTier::Unlimited),
            _ => None,
        }
    }
}

/// Model allow-list for a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedModels {
    Any,
    Only(HashSet<String>),
}

impl AllowedModels {
    /// Parses `*` or a comma-separated list of model ids.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" {
            return AllowedModels::Any;
        }
        AllowedModels::Only(
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn allows(&self, model_id: &str) -> bool {
        match self {
            AllowedModels::Any => true,
            AllowedModels::Only(set) => set.contains(model_id),
        }
    }
}

/// Static per-tier limits. Limits of `0` or `-1` mean unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct TierQuota {
    pub daily_calls: i64,
    pub daily_tokens: i64,
    pub max_output_tokens: u32,
    pub allowed_models: AllowedModels,
    /// Advisory only; not consulted by the coordinator.
    pub priority: u8,
}

impl TierQuota {
    pub fn defaults_for(tier: UserTier) -> Self {
        match tier {
            UserTier::Free => Self {
                daily_calls: 10,
                daily_tokens: 50_000,
                max_output_tokens: 2048,
                allowed_models: AllowedModels::Any,
                priority: 1,
            },
            UserTier::Vip => Self {
                daily_calls: 100,
                daily_tokens: 500_000,
                max_output_tokens: 4096,
                allowed_models: AllowedModels::Any,
                priority: 2,
            },
            UserTier::Premium => Self {
                daily_calls: 500,
                daily_tokens: 2_000_000,
                max_output_tokens: 8192,
                allowed_models: AllowedModels::Any,
                priority: 3,
            },
            UserTier::Unlimited => Self {
                daily_calls: -1,
                daily_tokens: -1,
                max_output_tokens: 8192,
                allowed_models: AllowedModels::Any,
                priority: 4,
            },
        }
    }
}

/// Whether a configured limit disables the check.
pub fn is_unlimited(limit: i64) -> bool {
    limit <= 0
}
