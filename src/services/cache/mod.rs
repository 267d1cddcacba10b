pub mod disk;
pub mod keys;
pub mod memory;
pub mod redis;
pub mod upstash;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

pub use disk::DiskCache;
pub use memory::{L1Cache, MemoryCache};

/// Value stored in place of a known-empty result.
pub const NULL_SENTINEL: &str = "__CACHE_NULL__";

/// Sliding-window check over a sorted set. Trim, count, and conditionally
/// add in one server-side step.
/// KEYS[1] = window key; ARGV = now_ms, window_ms, max, member.
pub const RATE_LIMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, window)
  return {1, count + 1}
end
return {0, count}
"#;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("upstash error: {0}")]
    Upstash(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Admitted calls in the window after this check.
    pub count: u64,
}

/// Key/value store with TTL plus an atomic sliding-window counter.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn rate_limit_check(
        &self,
        key: &str,
        window: Duration,
        max: u64,
        now_ms: i64,
    ) -> Result<RateDecision, CacheError>;
    fn backend(&self) -> &'static str;
}

// ── Settings ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub l1_ttl: Duration,
    pub l1_jitter: f64,
    pub l1_capacity: usize,
    pub l2_ttl: Duration,
    pub l2_jitter: f64,
    pub l3_ttl: Duration,
    pub l3_jitter: f64,
    pub null_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            l1_ttl: Duration::from_secs(3600),
            l1_jitter: 0.10,
            l1_capacity: 100,
            l2_ttl: Duration::from_secs(86_400),
            l2_jitter: 0.10,
            l3_ttl: Duration::from_secs(604_800),
            l3_jitter: 0.05,
            null_ttl: Duration::from_secs(60),
        }
    }
}

/// `base + uniform(-base*j, +base*j)`.
pub fn jittered(base: Duration, jitter: f64) -> Duration {
    let base_s = base.as_secs_f64();
    let spread = base_s * jitter.abs();
    if spread <= 0.0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((base_s + offset).max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

impl CacheLevel {
    pub const ALL: [CacheLevel; 3] = [CacheLevel::L1, CacheLevel::L2, CacheLevel::L3];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(String),
    /// The sentinel was found: the result is known to be empty.
    Empty,
    Miss,
}

// ── Stats ──────────────────────────────────────────────────

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TierCounters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1: TierStats,
    pub l2: TierStats,
    pub l3: TierStats,
    pub l1_size: usize,
    pub l2_backend: Option<&'static str>,
    pub l3_enabled: bool,
    /// Lookups answered by any tier over all lookups.
    pub hit_rate: f64,
}

// ── Multi-level cache ──────────────────────────────────────

/// L1 (in-process LRU) → L2 (shared KV) → L3 (disk). A hit in a lower tier
/// is copied into every tier above it.
pub struct MultiLevelCache {
    l1: L1Cache,
    l2: Option<Arc<dyn CacheClient>>,
    l3: Option<DiskCache>,
    settings: CacheSettings,
    l1_stats: TierCounters,
    l2_stats: TierCounters,
    l3_stats: TierCounters,
    lookups: AtomicU64,
    answered: AtomicU64,
}

impl MultiLevelCache {
    pub fn new(
        settings: CacheSettings,
        l2: Option<Arc<dyn CacheClient>>,
        l3: Option<DiskCache>,
    ) -> Self {
        Self {
            l1: L1Cache::new(settings.l1_capacity),
            l2,
            l3: l3.filter(DiskCache::is_enabled),
            settings,
            l1_stats: TierCounters::default(),
            l2_stats: TierCounters::default(),
            l3_stats: TierCounters::default(),
            lookups: AtomicU64::new(0),
            answered: AtomicU64::new(0),
        }
    }

    pub fn l1(&self) -> &L1Cache {
        &self.l1
    }

    pub async fn get(&self, kind: &str, inputs: &Value) -> CacheLookup {
        self.get_key(&keys::divination_key(kind, inputs)).await
    }

    pub async fn set(&self, kind: &str, inputs: &Value, value: &str, levels: Option<&[CacheLevel]>) {
        self.set_key(&keys::divination_key(kind, inputs), value, levels)
            .await
    }

    pub async fn set_null(&self, kind: &str, inputs: &Value) {
        self.set_null_key(&keys::divination_key(kind, inputs)).await
    }

    pub async fn invalidate(&self, kind: &str, inputs: &Value) {
        self.invalidate_key(&keys::divination_key(kind, inputs))
            .await
    }

    pub async fn get_key(&self, key: &str) -> CacheLookup {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.lookup(key).await;
        let result = match found {
            Some(v) if v == NULL_SENTINEL => CacheLookup::Empty,
            Some(v) => CacheLookup::Hit(v),
            None => CacheLookup::Miss,
        };
        if result != CacheLookup::Miss {
            self.answered.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Read L2 without counting the lookup or copying into L1. For entries
    /// that are not divination results.
    pub async fn peek_shared(&self, key: &str) -> Option<String> {
        let l2 = self.l2.as_ref()?;
        match l2.get(key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("L2 cache read failed: {}", e);
                None
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<String> {
        if let Some(v) = self.l1.get(key) {
            self.l1_stats.hit();
            return Some(v);
        }
        self.l1_stats.miss();

        if let Some(l2) = &self.l2 {
            match l2.get(key).await {
                Ok(Some(v)) => {
                    self.l2_stats.hit();
                    self.l1.set(key, &v, self.l1_ttl_for(&v));
                    return Some(v);
                }
                Ok(None) => self.l2_stats.miss(),
                Err(e) => {
                    tracing::warn!("L2 cache read failed: {}", e);
                    self.l2_stats.miss();
                }
            }
        }

        if let Some(l3) = &self.l3 {
            match l3.get(key).await {
                Ok(Some(v)) => {
                    self.l3_stats.hit();
                    self.l1.set(key, &v, self.l1_ttl_for(&v));
                    self.write_l2(key, &v, self.l2_ttl_for(&v)).await;
                    return Some(v);
                }
                Ok(None) => self.l3_stats.miss(),
                Err(e) => {
                    tracing::warn!("L3 cache read failed: {}", e);
                    self.l3_stats.miss();
                }
            }
        }
        None
    }

    /// Write `value` to the given tiers (all three when `levels` is `None`).
    pub async fn set_key(&self, key: &str, value: &str, levels: Option<&[CacheLevel]>) {
        let levels = levels.unwrap_or(&CacheLevel::ALL);
        if levels.contains(&CacheLevel::L1) {
            self.l1.set(key, value, self.l1_ttl_for(value));
        }
        if levels.contains(&CacheLevel::L2) {
            self.write_l2(key, value, self.l2_ttl_for(value)).await;
        }
        if levels.contains(&CacheLevel::L3) {
            if let Some(l3) = &self.l3 {
                let ttl = jittered(self.settings.l3_ttl, self.settings.l3_jitter);
                if let Err(e) = l3.set(key, value, ttl).await {
                    tracing::warn!("L3 cache write failed: {}", e);
                }
            }
        }
    }

    /// Record a known-empty result in L1 and L2 with the short null TTL.
    pub async fn set_null_key(&self, key: &str) {
        self.set_key(key, NULL_SENTINEL, Some(&[CacheLevel::L1, CacheLevel::L2]))
            .await
    }

    pub async fn invalidate_key(&self, key: &str) {
        self.l1.remove(key);
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.delete(key).await {
                tracing::warn!("L2 cache delete failed: {}", e);
            }
        }
        if let Some(l3) = &self.l3 {
            if let Err(e) = l3.delete(key).await {
                tracing::warn!("L3 cache delete failed: {}", e);
            }
        }
    }

    /// Drop expired L3 files. Returns how many were removed.
    pub async fn purge_disk(&self) -> usize {
        match &self.l3 {
            Some(l3) => l3.purge_expired().await.unwrap_or_else(|e| {
                tracing::warn!("L3 purge failed: {}", e);
                0
            }),
            None => 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.lookups.load(Ordering::Relaxed);
        let answered = self.answered.load(Ordering::Relaxed);
        CacheStats {
            l1: self.l1_stats.snapshot(),
            l2: self.l2_stats.snapshot(),
            l3: self.l3_stats.snapshot(),
            l1_size: self.l1.len(),
            l2_backend: self.l2.as_ref().map(|c| c.backend()),
            l3_enabled: self.l3.is_some(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                answered as f64 / lookups as f64
            },
        }
    }

    async fn write_l2(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.set_with_ttl(key, value, ttl).await {
                tracing::warn!("L2 cache write failed: {}", e);
            }
        }
    }

    fn l1_ttl_for(&self, value: &str) -> Duration {
        if value == NULL_SENTINEL {
            self.settings.null_ttl
        } else {
            jittered(self.settings.l1_ttl, self.settings.l1_jitter)
        }
    }

    fn l2_ttl_for(&self, value: &str) -> Duration {
        if value == NULL_SENTINEL {
            self.settings.null_ttl
        } else {
            jittered(self.settings.l2_ttl, self.settings.l2_jitter)
        }
    }
}
