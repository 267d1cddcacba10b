use std::sync::Arc;

use crate::config::Config;
use crate::models::policy::Thresholds;
use crate::services::adapters::AdapterFactory;
use crate::services::cache::{CacheClient, CacheSettings, DiskCache, MultiLevelCache};
use crate::services::coordinator::{CoordinatorSettings, RequestCoordinator};
use crate::services::cost_monitor::CostMonitor;
use crate::services::degradation::DegradationController;
use crate::services::failover::{FailoverEngine, FailoverSettings};
use crate::services::health::HealthChecker;
use crate::services::prompt::TemplatePromptBuilder;
use crate::services::provider_pool::ProviderPool;
use crate::services::quota::QuotaLedger;
use crate::services::rate_limiter::RateLimiter;

pub struct AppState {
    pub config: Config,
    pub coordinator: Arc<RequestCoordinator>,
    pub pool: Arc<ProviderPool>,
    pub cache: Arc<MultiLevelCache>,
    pub quota: Arc<QuotaLedger>,
    pub degradation: Arc<DegradationController>,
    pub monitor: Arc<CostMonitor>,
}

impl AppState {
    /// Wire every subsystem once. `shared` backs both L2 and the rate limiter.
    /// Spawns the ledger writer, so it must run inside the runtime.
    pub fn build(
        config: Config,
        pool: ProviderPool,
        factory: Arc<dyn AdapterFactory>,
        shared: Arc<dyn CacheClient>,
    ) -> Arc<Self> {
        let disk = DiskCache::new(config.cache_dir.clone(), config.read_only_fs);
        let cache = Arc::new(MultiLevelCache::new(
            CacheSettings::default(),
            Some(shared.clone()),
            Some(disk),
        ));
        let limiter = Arc::new(RateLimiter::new(
            shared,
            config.rate_anonymous,
            config.rate_authenticated,
        ));
        let quota = Arc::new(QuotaLedger::new(config.quota.clone()));
        let failover = Arc::new(FailoverEngine::new(
            factory,
            Arc::new(HealthChecker::default()),
            FailoverSettings::default(),
        ));
        let pool = Arc::new(pool);
        let degradation = Arc::new(DegradationController::new(Thresholds {
            min_error_samples: config.min_error_samples,
            ..Thresholds::default()
        }));
        let monitor = Arc::new(CostMonitor::new());

        let coordinator = Arc::new(RequestCoordinator::new(
            pool.clone(),
            failover,
            cache.clone(),
            limiter,
            quota.clone(),
            degradation.clone(),
            monitor.clone(),
            Arc::new(TemplatePromptBuilder),
            CoordinatorSettings {
                production: config.production,
                quota_on_custom_key: config.quota_on_custom_key,
                quota_on_anonymous: config.quota_on_anonymous,
                limits: config.limits.clone(),
                ..CoordinatorSettings::default()
            },
        ));

        Arc::new(Self {
            config,
            coordinator,
            pool,
            cache,
            quota,
            degradation,
            monitor,
        })
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::models::provider::PoolConfig;
    use crate::services::cache::MemoryCache;
    use crate::services::testing::{entry, ScriptedFactory};

    /// State over scripted adapters and an in-memory cache, with no files
    /// touched. `vars` are extra configuration values.
    pub fn state(factory: ScriptedFactory, pool: &[&str], vars: &[(&str, &str)]) -> Arc<AppState> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::from_lookup(|key| {
            vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
        .unwrap();
        config.read_only_fs = true;
        config.quota.data_dir = None;

        let mut entries = pool.iter().map(|n| entry(n));
        let pool = ProviderPool::from_config(PoolConfig {
            primary: entries.next(),
            backups: entries.collect(),
        });
        AppState::build(config, pool, Arc::new(factory), Arc::new(MemoryCache::new()))
    }
}
