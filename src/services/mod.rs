pub mod adapters;
pub mod cache;
pub mod coordinator;
pub mod cost_monitor;
pub mod degradation;
pub mod failover;
pub mod health;
pub mod http_pool;
pub mod prompt;
pub mod provider_pool;
pub mod quota;
pub mod rate_limiter;
pub mod sse;
pub mod token_counter;

#[cfg(test)]
pub mod testing;
