//! Redis connection layer backing the durable payment outcome store.
//!
//! Records and the pending index live in Redis so that any process sharing the
//! same Redis can observe an order's final status, and writes to a record are
//! fanned out over pub/sub for live observers.

pub mod error;
pub mod keys;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::time::Duration;
use tracing::{error, info, warn};

use error::{CacheError, CacheResult};

/// Redis connection pool type alias
pub type RedisPool = Pool<RedisConnectionManager>;

/// Redis cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum idle connections
    pub min_idle: u32,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection
    pub max_lifetime: Duration,
    /// Idle timeout before closing connection
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 20,
            min_idle: 2,
            connection_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            max_connections: std::env::var("REDIS_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            min_idle: std::env::var("REDIS_MIN_IDLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_idle),
            connection_timeout: std::env::var("REDIS_CONNECTION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.connection_timeout),
            ..defaults
        }
    }
}

/// Builds the pool behind the durable outcome store. An unreachable Redis at
/// startup is logged, not fatal: bb8 reconnects lazily, and until then
/// outcome writes settle in the in-process cache only.
pub async fn init_cache_pool(config: &CacheConfig) -> CacheResult<RedisPool> {
    info!(
        max_connections = config.max_connections,
        min_idle = config.min_idle,
        redis_url = %config.redis_url,
        "Initializing Redis pool for outcome records"
    );

    let manager = RedisConnectionManager::new(config.redis_url.clone()).map_err(|e| {
        error!(error = %e, "invalid Redis connection settings");
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(Some(config.min_idle.min(config.max_connections)))
        .connection_timeout(config.connection_timeout)
        .max_lifetime(Some(config.max_lifetime))
        .idle_timeout(Some(config.idle_timeout))
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to build Redis pool");
            CacheError::ConnectionError(e.to_string())
        })?;

    match ping(&pool).await {
        Ok(()) => info!("Redis pool ready"),
        Err(e) => warn!(error = %e, "Redis not reachable yet, continuing"),
    }
    Ok(pool)
}

async fn ping(pool: &RedisPool) -> CacheResult<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}

/// Logs the pool state on the way out; bb8 closes connections when the last
/// handle is dropped.
pub async fn shutdown_cache_pool(pool: RedisPool) {
    let state = pool.state();
    info!(
        connections = state.connections,
        idle_connections = state.idle_connections,
        "Shutting down Redis pool"
    );
    drop(pool);
}
