use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{CacheClient, CacheError, RateDecision, RATE_LIMIT_SCRIPT};

/// Shared KV backed by Redis. Single-key commands are atomic on the server;
/// the sliding window runs as one Lua script.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    script: redis::Script,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: redis::Script::new(RATE_LIMIT_SCRIPT),
        }
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let _: () = conn.pset_ex(key, value, ttl_ms).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn rate_limit_check(
        &self,
        key: &str,
        window: Duration,
        max: u64,
        now_ms: i64,
    ) -> Result<RateDecision, CacheError> {
        let mut conn = self.conn.clone();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());
        let (allowed, count): (i64, i64) = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window.as_millis() as i64)
            .arg(max)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(RateDecision {
            allowed: allowed == 1,
            count: count.max(0) as u64,
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
