use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CacheClient, CacheError, RateDecision};

/// In-process shared store used when `CACHE_CLIENT_TYPE=memory`.
/// Expiry uses the monotonic clock, so wall-clock skew cannot revive entries.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    windows: Mutex<HashMap<String, RateWindow>>,
}

/// Admitted timestamps (ms) for one key, with the window they were checked
/// against so idle keys can be purged.
#[derive(Default)]
struct RateWindow {
    stamps: Vec<i64>,
    window_ms: i64,
}

impl RateWindow {
    fn trim(&mut self, now_ms: i64) {
        let floor = now_ms - self.window_ms;
        self.stamps.retain(|ts| *ts > floor);
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries and rate-limit windows with no stamp left.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now().timestamp_millis())
    }

    pub fn purge_expired_at(&self, now_ms: i64) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        let mut purged = before - entries.len();
        drop(entries);

        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.trim(now_ms);
            !w.stamps.is_empty()
        });
        purged += before - windows.len();
        purged
    }

    #[cfg(test)]
    fn window_count(&self) -> usize {
        self.windows.lock().len()
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn rate_limit_check(
        &self,
        key: &str,
        window: Duration,
        max: u64,
        now_ms: i64,
    ) -> Result<RateDecision, CacheError> {
        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_default();
        entry.window_ms = window.as_millis() as i64;

        entry.trim(now_ms);
        let count = entry.stamps.len() as u64;
        if count < max {
            entry.stamps.push(now_ms);
            Ok(RateDecision {
                allowed: true,
                count: count + 1,
            })
        } else {
            Ok(RateDecision {
                allowed: false,
                count,
            })
        }
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct L1Entry {
    value: String,
    expires_at: Instant,
}

/// Size-bounded LRU with per-entry expiry. Every operation holds the
/// cache mutex.
pub struct L1Cache {
    inner: Mutex<LruCache<String, L1Entry>>,
}

impl L1Cache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        inner.pop(key);
        None
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.inner.lock().put(
            key.to_string(),
            L1Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Expiry instant of a live entry.
    pub fn expires_at(&self, key: &str) -> Option<Instant> {
        self.inner.lock().peek(key).map(|e| e.expires_at)
    }
}
