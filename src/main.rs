mod config;
mod error;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{HeaderName, HeaderValue},
    middleware as axum_mw, Router,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use config::{CacheBackend, Config};
use error::ConfigError;
use services::adapters::HttpAdapterFactory;
use services::cache::redis::RedisCache;
use services::cache::upstash::UpstashCache;
use services::cache::{CacheClient, MemoryCache};
use services::http_pool::HttpClientPool;
use services::provider_pool::ProviderPool;
use services::quota::QuotaLedger;
use state::AppState;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config = Config::from_env()?;
    tracing::info!(
        "Starting divination broker on {} ({})",
        config.listen_addr,
        if config.production { "production" } else { "development" }
    );

    // Shared cache client: L2 and the rate limiter
    let mut memory: Option<Arc<MemoryCache>> = None;
    let shared: Arc<dyn CacheClient> = match &config.cache_backend {
        CacheBackend::Memory => {
            let cache = Arc::new(MemoryCache::new());
            memory = Some(cache.clone());
            cache
        }
        CacheBackend::Redis { url } => {
            let cache = RedisCache::connect(url).await?;
            tracing::info!("Connected to Redis");
            Arc::new(cache)
        }
        CacheBackend::Upstash { url, token } => Arc::new(UpstashCache::new(url, token)?),
    };
    tracing::info!("Cache client: {}", config.cache_backend.as_str());

    // Provider pool
    let pool = ProviderPool::new(config.providers.clone(), config.pool_file.clone())?;
    if !pool.has_active() {
        if config.production {
            return Err(ConfigError::NoProvidersConfigured.into());
        }
        tracing::warn!("No active provider configured; only x-api-key requests can be served");
    }

    let factory = Arc::new(HttpAdapterFactory::new(
        Arc::new(HttpClientPool::new()),
        config.timeouts,
    ));

    // Build shared state
    let state = AppState::build(config.clone(), pool, factory, shared);
    let loaded = state.quota.load_today();
    tracing::info!("Loaded today's usage for {} user(s)", loaded);

    // Degradation loop
    tokio::spawn(state.degradation.clone().run(
        state.monitor.clone(),
        state.cache.clone(),
        config.degradation_tick,
    ));

    // Hourly maintenance: usage files, L3 files, monitor buckets
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                let files = state.quota.cleanup(QuotaLedger::today());
                let disk = state.cache.purge_disk().await;
                let buckets = state.monitor.cleanup();
                let memory = memory.as_ref().map_or(0, |m| m.purge_expired());
                if files + disk + buckets + memory > 0 {
                    tracing::info!(
                        "Maintenance removed {} usage file(s), {} cache file(s), {} metric bucket(s), {} memory key(s)",
                        files,
                        disk,
                        buckets,
                        memory
                    );
                }
            }
        });
    }

    // Build routes
    let divination_routes = routes::divination::router().route_layer(
        axum_mw::from_fn_with_state(state.clone(), middleware::auth::resolve_identity),
    );

    let mut app = Router::new()
        .merge(divination_routes)
        .merge(routes::health::router());

    if config.admin_key.is_some() {
        let admin_routes = routes::admin::router().route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::auth::admin_auth,
        ));
        app = app.nest("/admin", admin_routes);
    } else {
        tracing::info!("ADMIN_KEY not set; admin routes disabled");
    }

    let allow_origin = if config.cors_origin == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-api-url"),
            HeaderName::from_static("x-api-model"),
        ]);

    let app = app
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Start server
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.quota.flush()?;
    tracing::info!("Usage ledger flushed, bye");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
