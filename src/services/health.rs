use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::models::chat::{ChatMessage, ChatParams};
use crate::models::provider::{ModelEntry, ProviderKind};
use crate::services::adapters::ProviderAdapter;

type HealthKey = (ProviderKind, String, String);

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub ttl: Duration,
    pub probe_timeout: Duration,
    pub capacity: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            capacity: 100,
        }
    }
}

/// Probes candidates with a one-token chat and remembers the verdict per
/// `(provider, base_url, model)`. Failures are cached like successes.
pub struct HealthChecker {
    results: Mutex<LruCache<HealthKey, (bool, Instant)>>,
    settings: HealthSettings,
}

impl HealthChecker {
    pub fn new(settings: HealthSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            results: Mutex::new(LruCache::new(capacity)),
            settings,
        }
    }

    /// Cached verdict if it is still fresh.
    pub fn cached(&self, entry: &ModelEntry) -> Option<bool> {
        let key = entry.health_key();
        let mut results = self.results.lock();
        match results.get(&key) {
            Some((healthy, seen_at)) if seen_at.elapsed() < self.settings.ttl => Some(*healthy),
            Some(_) => {
                results.pop(&key);
                None
            }
            None => None,
        }
    }

    pub async fn check(&self, entry: &ModelEntry, adapter: &dyn ProviderAdapter) -> bool {
        if let Some(healthy) = self.cached(entry) {
            return healthy;
        }

        let messages = [ChatMessage::user("ping")];
        let params = ChatParams::default().with_max_tokens(1);
        let healthy = match tokio::time::timeout(
            self.settings.probe_timeout,
            adapter.chat(&messages, &params),
        )
        .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!("Health probe failed for {}: {}", entry.name, e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Health probe for {} timed out after {:?}",
                    entry.name,
                    self.settings.probe_timeout
                );
                false
            }
        };

        self.record(entry, healthy);
        healthy
    }

    pub fn record(&self, entry: &ModelEntry, healthy: bool) {
        self.results
            .lock()
            .put(entry.health_key(), (healthy, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthSettings::default())
    }
}
