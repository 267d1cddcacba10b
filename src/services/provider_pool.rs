use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::ConfigError;
use crate::models::provider::{ModelEntry, ModelEntryInfo, PoolConfig};

/// The ordered, hot-reloadable set of upstream entries.
///
/// Entries from the environment are fixed at start; entries from the pool file
/// are re-read on [`ProviderPool::reload`].
pub struct ProviderPool {
    config: RwLock<PoolConfig>,
    env_entries: Vec<ModelEntry>,
    pool_file: Option<PathBuf>,
}

impl ProviderPool {
    pub fn new(env_entries: Vec<ModelEntry>, pool_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let file = match &pool_file {
            Some(path) => read_pool_file(path)?,
            None => PoolConfig::default(),
        };
        Ok(Self {
            config: RwLock::new(merge_pools(&env_entries, file)),
            env_entries,
            pool_file,
        })
    }

    /// Pool with a fixed configuration and no reload source.
    pub fn from_config(config: PoolConfig) -> Self {
        Self {
            config: RwLock::new(config),
            env_entries: Vec::new(),
            pool_file: None,
        }
    }

    /// Active entries in failover order, primary first.
    pub fn candidates(&self) -> Vec<ModelEntry> {
        self.config
            .read()
            .ordered()
            .into_iter()
            .filter(ModelEntry::is_active)
            .collect()
    }

    pub fn has_active(&self) -> bool {
        self.config.read().has_active()
    }

    pub fn list(&self) -> Vec<ModelEntryInfo> {
        self.config
            .read()
            .ordered()
            .iter()
            .map(ModelEntryInfo::from)
            .collect()
    }

    pub fn replace(&self, config: PoolConfig) {
        *self.config.write() = config;
    }

    /// Re-read the pool file and swap the configuration in one step.
    /// Returns the number of entries now in the pool.
    pub fn reload(&self) -> Result<usize, ConfigError> {
        let file = match &self.pool_file {
            Some(path) => read_pool_file(path)?,
            None => PoolConfig::default(),
        };
        let merged = merge_pools(&self.env_entries, file);
        let count = merged.ordered().len();
        tracing::info!("Provider pool reloaded: {} entries", count);
        self.replace(merged);
        Ok(count)
    }
}

/// The file's primary leads, then environment entries, then the file's backups.
/// The first entry of the result is the primary.
pub fn merge_pools(env_entries: &[ModelEntry], file: PoolConfig) -> PoolConfig {
    let mut ordered: Vec<ModelEntry> = Vec::new();
    ordered.extend(file.primary);
    ordered.extend(env_entries.iter().cloned());
    ordered.extend(file.backups);

    let mut iter = ordered.into_iter();
    PoolConfig {
        primary: iter.next(),
        backups: iter.collect(),
    }
}

pub fn read_pool_file(path: &Path) -> Result<PoolConfig, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "PROVIDER_POOL_FILE".to_string(),
        reason,
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw).map_err(|e| invalid(format!("{}: {}", path.display(), e)))
}
