use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use cache::{
    DistributedStore, MemoryBackend, RedisBackend, StoreBackend, StoreError,
    operations::{ClientIdentity, RateLimitPolicy, RefreshTokenStore, SlidingWindowLimiter},
};
use config::{Config, StoreKind};
use middleware::{RequestGate, log_errors, rate_limit};
use resilience::{BreakerOptions, CircuitBreakerRegistry};
use utils::{TokenSigner, hash_identity};

pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod resilience;
pub mod routes;
pub mod utils;

/// 刷新接口的独立限额
pub const REFRESH_LIMIT: u32 = 10;
pub const REFRESH_WINDOW_MS: u64 = 60_000;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<DistributedStore>,
    pub tokens: Arc<RefreshTokenStore>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

impl AppState {
    /// 用给定的存储后端组装全部组件
    pub fn with_backend(config: Config, backend: Arc<dyn StoreBackend>) -> Self {
        let store = Arc::new(
            DistributedStore::new(backend, config.cache_default_namespace.clone())
                .with_scan_batch(config.cache_scan_batch),
        );
        let tokens = Arc::new(RefreshTokenStore::new(store.clone(), TokenSigner::from_config(&config)));
        let limiter = Arc::new(SlidingWindowLimiter::new(
            store.clone(),
            RateLimitPolicy::new(config.rate_limit_limit, config.rate_limit_window_ms),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerOptions::from_config(&config)));

        Self {
            config,
            store,
            tokens,
            limiter,
            breakers,
        }
    }

    /// 按配置选择存储后端；Redis 连接在首次使用时建立
    pub fn from_config(config: Config) -> Result<Self, StoreError> {
        let backend: Arc<dyn StoreBackend> = match config.store_kind {
            StoreKind::Redis => Arc::new(RedisBackend::new(
                &config.redis_url(),
                config.redis_command_timeout(),
                config.redis_max_retries,
            )?),
            StoreKind::Memory => {
                tracing::warn!("Using in-process memory store, state is not shared between instances");
                Arc::new(MemoryBackend::new())
            }
        };
        Ok(Self::with_backend(config, backend))
    }
}

/// 刷新接口按 IP 单独计数，不与默认窗口共用
fn refresh_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(REFRESH_LIMIT, REFRESH_WINDOW_MS)
        .with_key_fn(|identity: &ClientIdentity| format!("refresh:{}", hash_identity(&identity.ip)))
}

pub fn build_router(state: AppState) -> Router {
    let gate = RequestGate::new(state.limiter.clone(), state.tokens.clone());

    let refresh_routes = Router::new()
        .route("/auth/refresh", post(routes::auth::refresh))
        .route_layer(from_fn_with_state(gate.clone().with_policy(refresh_policy()), rate_limit));

    let session_routes = Router::new()
        .route("/auth/logout", post(routes::auth::logout))
        .route("/auth/logout-all", post(routes::auth::logout_all))
        .route("/health", get(routes::health::health))
        .route_layer(from_fn_with_state(gate, rate_limit));

    Router::new()
        .merge(refresh_routes)
        .merge(session_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(from_fn(log_errors)),
        )
        .with_state(state)
}
