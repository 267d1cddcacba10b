use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::adapters::ProviderError;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_HOST: usize = 20;
const MAX_CONNECTIONS: usize = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A shared client plus the limiter capping in-flight requests to one upstream.
#[derive(Clone)]
pub struct PooledClient {
    pub client: reqwest::Client,
    limiter: Arc<Semaphore>,
}

impl PooledClient {
    /// Wait for a connection slot. Hold the permit for the whole exchange,
    /// including the streamed body.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ProviderError> {
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ProviderError::Config(format!("connection limiter closed: {e}")))
    }
}

/// One keep-alive client per upstream base URL, shared by every request and
/// health probe that targets it.
#[derive(Default)]
pub struct HttpClientPool {
    clients: Mutex<HashMap<String, PooledClient>>,
}

impl HttpClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or build the client for `base_url`. `reqwest::Client` is an `Arc`
    /// internally, so the returned clone shares the connection pool.
    pub fn client_for(&self, base_url: &str) -> Result<PooledClient, ProviderError> {
        let mut clients = self.clients.lock();
        if let Some(pooled) = clients.get(base_url) {
            return Ok(pooled.clone());
        }

        let client = reqwest::Client::builder()
            .pool_idle_timeout(KEEP_ALIVE)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .tcp_keepalive(KEEP_ALIVE)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Config(format!("HTTP client build failed: {e}")))?;

        let pooled = PooledClient {
            client,
            limiter: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        };
        tracing::debug!("Created HTTP client for {}", base_url);
        clients.insert(base_url.to_string(), pooled.clone());
        Ok(pooled)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// Drop the pooled client so its idle connections close once the last
    /// in-flight clone is gone.
    pub fn evict(&self, base_url: &str) {
        self.clients.lock().remove(base_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_client_per_base_url() {
        let pool = HttpClientPool::new();
        pool.client_for("https://a.example.com/v1").unwrap();
        pool.client_for("https://a.example.com/v1").unwrap();
        pool.client_for("https://b.example.com/v1").unwrap();
        assert_eq!(pool.len(), 2);
        pool.evict("https://a.example.com/v1");
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn permits_are_shared_across_clones() {
        let pool = HttpClientPool::new();
        let a = pool.client_for("https://a.example.com").unwrap();
        let b = pool.client_for("https://a.example.com").unwrap();
        let _p1 = a.acquire().await.unwrap();
        assert_eq!(b.limiter.available_permits(), MAX_CONNECTIONS - 1);
    }
}
