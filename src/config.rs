use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;

use crate::error::ConfigError;
use crate::models::provider::{ModelEntry, ProviderKind};
use crate::models::usage::{AllowedModels, UserTier};
use crate::services::adapters::AdapterTimeouts;
use crate::services::prompt::InputLimits;
use crate::services::quota::QuotaSettings;
use crate::services::rate_limiter::RateProfile;

const MIN_JWT_SECRET_LEN: usize = 32;

/// Secrets that show up in tutorials and sample `.env` files, matched whole.
const WEAK_JWT_SECRETS: &[&str] = &[
    "secret",
    "changeme",
    "change-me",
    "password",
    "jwt_secret",
    "jwt-secret",
    "your-secret-key",
    "your_jwt_secret",
    "default",
    "development",
    "test",
    "your-256-bit-secret",
    "please-change-this-secret-in-production",
    "supersecretkeythatshouldbechanged",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis { url: String },
    Upstash { url: String, token: String },
}

impl CacheBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheBackend::Memory => "memory",
            CacheBackend::Redis { .. } => "redis",
            CacheBackend::Upstash { .. } => "upstash_kv",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// `APP_ENV=production`: strict secret and transport checks.
    pub production: bool,
    /// Comma-separated list of allowed CORS origins, or "*" for any.
    pub cors_origin: String,
    /// Admin routes are mounted only when set.
    pub admin_key: Option<String>,
    pub jwt_secret: Option<String>,
    pub cache_backend: CacheBackend,
    pub trusted_proxies: Vec<IpNet>,
    /// Disables the on-disk cache tier.
    pub read_only_fs: bool,
    pub cache_dir: PathBuf,
    pub rate_anonymous: RateProfile,
    pub rate_authenticated: RateProfile,
    pub quota: QuotaSettings,
    pub quota_on_custom_key: bool,
    /// Anonymous callers are held to the daily quota only when set; otherwise
    /// the anonymous rate limit governs them.
    pub quota_on_anonymous: bool,
    pub timeouts: AdapterTimeouts,
    pub degradation_tick: Duration,
    /// Calls needed in the trailing hour before the error rate counts.
    pub min_error_samples: u64,
    pub limits: InputLimits,
    /// Entries built from `OPENAI_*`, `ANTHROPIC_*` and `GEMINI_*`.
    pub providers: Vec<ModelEntry>,
    pub pool_file: Option<PathBuf>,
}

/// Reads one configuration value. Blank values count as unset.
struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
            None => default,
        }
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(lookup);
        let production = env.or("APP_ENV", "development").eq_ignore_ascii_case("production");

        let jwt_secret = env.get("JWT_SECRET");
        if production {
            validate_jwt_secret(jwt_secret.as_deref())?;
        }

        let cache_backend = cache_backend(&env)?;
        if production && cache_backend == CacheBackend::Memory {
            tracing::warn!(
                "CACHE_CLIENT_TYPE=memory in production: rate limits and L2 are per-process"
            );
        }

        let window = Duration::from_secs(env.parse("RATE_LIMIT_WINDOW_SECS", 3600u64)?);
        let data_dir = PathBuf::from(env.or("DATA_DIR", "./data"));

        Ok(Self {
            listen_addr: env.or("LISTEN_ADDR", "0.0.0.0:3000"),
            production,
            cors_origin: env.or("CORS_ORIGIN", "*"),
            admin_key: env.get("ADMIN_KEY"),
            jwt_secret,
            cache_backend,
            trusted_proxies: trusted_proxies(&env)?,
            read_only_fs: env.bool("READ_ONLY_FS", false),
            cache_dir: env
                .get("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("cache")),
            rate_anonymous: RateProfile {
                max: env.parse("RATE_LIMIT_ANON", 60u64)?,
                window,
            },
            rate_authenticated: RateProfile {
                max: env.parse("RATE_LIMIT_AUTH", 600u64)?,
                window,
            },
            quota: quota_settings(&env, data_dir)?,
            quota_on_custom_key: env.bool("QUOTA_ON_CUSTOM_KEY", true),
            quota_on_anonymous: env.bool("QUOTA_ON_ANONYMOUS", false),
            timeouts: AdapterTimeouts {
                open: Duration::from_secs(env.parse("UPSTREAM_OPEN_TIMEOUT_SECS", 60u64)?),
                idle: Duration::from_secs(env.parse("UPSTREAM_IDLE_TIMEOUT_SECS", 30u64)?),
            },
            degradation_tick: Duration::from_secs(env.parse("DEGRADATION_TICK_SECS", 30u64)?.max(1)),
            min_error_samples: env.parse("DEGRADATION_MIN_ERROR_SAMPLES", 20u64)?,
            limits: InputLimits {
                max_chars: env.parse("MAX_PROMPT_CHARS", 2000usize)?,
                stop_words: env
                    .get("STOP_WORDS")
                    .map(|raw| split_list(&raw))
                    .unwrap_or_default(),
            },
            providers: provider_entries(&env)?,
            pool_file: env.get("PROVIDER_POOL_FILE").map(PathBuf::from),
        })
    }
}

fn validate_jwt_secret(secret: Option<&str>) -> Result<(), ConfigError> {
    let secret = secret.ok_or_else(|| ConfigError::WeakJwtSecret("not set".into()))?;
    if secret.chars().count() < MIN_JWT_SECRET_LEN {
        return Err(ConfigError::WeakJwtSecret(format!(
            "shorter than {} characters",
            MIN_JWT_SECRET_LEN
        )));
    }
    let lowered = secret.to_lowercase();
    if WEAK_JWT_SECRETS.iter().any(|w| lowered == *w)
        || secret.chars().all(|c| c == secret.chars().next().unwrap_or(c))
    {
        return Err(ConfigError::WeakJwtSecret("matches a known weak value".into()));
    }
    Ok(())
}

fn cache_backend<F: Fn(&str) -> Option<String>>(env: &Lookup<F>) -> Result<CacheBackend, ConfigError> {
    let missing = |key: &str| ConfigError::Invalid {
        key: key.to_string(),
        reason: "required by CACHE_CLIENT_TYPE".into(),
    };
    match env.or("CACHE_CLIENT_TYPE", "memory").to_lowercase().as_str() {
        "memory" => Ok(CacheBackend::Memory),
        "redis" => Ok(CacheBackend::Redis {
            url: env.or("REDIS_URL", "redis://127.0.0.1:6379"),
        }),
        "upstash_kv" | "upstash" => Ok(CacheBackend::Upstash {
            url: env
                .get("UPSTASH_REDIS_REST_URL")
                .ok_or_else(|| missing("UPSTASH_REDIS_REST_URL"))?,
            token: env
                .get("UPSTASH_REDIS_REST_TOKEN")
                .ok_or_else(|| missing("UPSTASH_REDIS_REST_TOKEN"))?,
        }),
        other => Err(ConfigError::Invalid {
            key: "CACHE_CLIENT_TYPE".into(),
            reason: format!("unknown backend '{}'", other),
        }),
    }
}

/// CIDRs, or bare addresses taken as single-host networks.
fn trusted_proxies<F: Fn(&str) -> Option<String>>(env: &Lookup<F>) -> Result<Vec<IpNet>, ConfigError> {
    let Some(raw) = env.get("TRUSTED_PROXIES") else {
        return Ok(Vec::new());
    };
    split_list(&raw)
        .into_iter()
        .map(|item| {
            item.parse::<IpNet>()
                .or_else(|_| item.parse::<std::net::IpAddr>().map(IpNet::from))
                .map_err(|_| ConfigError::Invalid {
                    key: "TRUSTED_PROXIES".into(),
                    reason: format!("'{}' is not an address or CIDR", item),
                })
        })
        .collect()
}

fn quota_settings<F: Fn(&str) -> Option<String>>(
    env: &Lookup<F>,
    data_dir: PathBuf,
) -> Result<QuotaSettings, ConfigError> {
    let mut settings = QuotaSettings {
        data_dir: Some(data_dir),
        retention_days: env.parse("USAGE_RETENTION_DAYS", 30u32)?,
        ..QuotaSettings::default()
    };

    for (tier, quota) in settings.tiers.iter_mut() {
        let prefix = format!("QUOTA_{}", tier.as_str().to_uppercase());
        quota.daily_calls = env.parse(&format!("{}_DAILY_CALLS", prefix), quota.daily_calls)?;
        quota.daily_tokens = env.parse(&format!("{}_DAILY_TOKENS", prefix), quota.daily_tokens)?;
        quota.max_output_tokens =
            env.parse(&format!("{}_MAX_OUTPUT_TOKENS", prefix), quota.max_output_tokens)?;
        if let Some(models) = env.get(&format!("{}_MODELS", prefix)) {
            quota.allowed_models = AllowedModels::parse(&models);
        }
    }

    if let Some(raw) = env.get("QUOTA_USER_TIERS") {
        for pair in split_list(&raw) {
            let (user, tier) = pair.rsplit_once('=').ok_or_else(|| ConfigError::Invalid {
                key: "QUOTA_USER_TIERS".into(),
                reason: format!("'{}' is not id=tier", pair),
            })?;
            let tier = UserTier::from_str(tier).ok_or_else(|| ConfigError::Invalid {
                key: "QUOTA_USER_TIERS".into(),
                reason: format!("unknown tier '{}'", tier),
            })?;
            settings.user_tiers.insert(user.trim().to_string(), tier);
        }
    }
    Ok(settings)
}

/// One entry per provider whose `<PREFIX>_API_KEY` is set, in the order
/// OpenAI-compatible, Anthropic, Gemini.
fn provider_entries<F: Fn(&str) -> Option<String>>(env: &Lookup<F>) -> Result<Vec<ModelEntry>, ConfigError> {
    let known = [
        ("OPENAI", ProviderKind::OpenAiCompatible, "gpt-4o-mini", 0.0006),
        ("ANTHROPIC", ProviderKind::Anthropic, "claude-3-5-haiku-latest", 0.004),
        ("GEMINI", ProviderKind::Gemini, "gemini-1.5-flash", 0.0003),
    ];

    let mut entries = Vec::new();
    for (prefix, kind, default_model, default_cost) in known {
        let Some(api_key) = env.get(&format!("{}_API_KEY", prefix)) else {
            continue;
        };
        let base_url = env.or(&format!("{}_BASE_URL", prefix), kind.default_base_url());
        let model = env.or(&format!("{}_MODEL", prefix), default_model);
        let cost = env.parse(&format!("{}_COST_PER_1K", prefix), default_cost)?;
        entries.push(
            ModelEntry::new(prefix.to_lowercase(), kind, base_url, api_key, model).with_cost(cost),
        );
    }
    Ok(entries)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
