//! Cache client used by the request orchestrator.
//!
//! The orchestrator only needs two asynchronous operations against the
//! external store:
//! - `get(key)`: the stored value, or `None` when the key is absent
//! - `set(key, value)`: unconditional overwrite
//!
//! `RedisCache` talks to Redis through a `fred` pool. `MemoryCache` keeps the
//! same contract in-process for local runs and tests.

use crate::config::{CacheBackend, Config};
use crate::storage::MemoryCache;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{Config as RedisConfig, ReconnectPolicy};
use fred::types::Builder;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Asynchronous get/set against a key-value store
pub trait CacheClient: Send + Sync + 'static {
    /// Fetch a value. A missing key is `Ok(None)`, never an error.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, CacheError>> + Send;

    /// Store a value, replacing whatever was there.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), CacheError>> + Send;
}

/// Store access errors
#[derive(Debug)]
pub enum CacheError {
    /// Error reported by the Redis client (connection loss, timeout, ...)
    Redis(fred::error::Error),
    /// Store could not serve the operation
    Unavailable(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Redis(e) => write!(f, "Redis error: {}", e),
            CacheError::Unavailable(msg) => write!(f, "Cache unavailable: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<fred::error::Error> for CacheError {
    fn from(e: fred::error::Error) -> Self {
        CacheError::Redis(e)
    }
}

/// Redis-backed cache client sharing one connection pool
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    /// Connect a pool to the Redis server at `url`.
    ///
    /// The first connection attempt fails fast. Once connected, lost
    /// connections are retried in the background with exponential backoff,
    /// while each command gives up after `command_timeout` so callers see an
    /// error instead of waiting for the store to come back.
    pub async fn connect(
        url: &str,
        pool_size: usize,
        command_timeout: Duration,
    ) -> Result<Self, CacheError> {
        let mut config = RedisConfig::from_url(url)?;
        config.fail_fast = true;

        let mut builder = Builder::from_config(config);
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
        builder.with_performance_config(|perf| {
            perf.default_command_timeout = command_timeout;
        });

        let pool = builder.build_pool(pool_size)?;
        pool.init().await?;

        info!(url, pool_size, "Connected to Redis");

        Ok(RedisCache { pool })
    }
}

impl CacheClient for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let value: Option<String> = self.pool.get(key).await?;
        debug!(key, hit = value.is_some(), "Redis GET");
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.pool
            .set::<(), _, _>(key, value, None, None, false)
            .await?;
        debug!(key, value, "Redis SET");
        Ok(())
    }
}

/// Cache backend selected at startup
#[derive(Clone)]
pub enum Backend {
    Redis(RedisCache),
    Memory(MemoryCache),
}

impl Backend {
    /// Build the backend named in the configuration
    pub async fn from_config(config: &Config) -> Result<Self, CacheError> {
        match config.cache_backend {
            CacheBackend::Redis => {
                let cache = RedisCache::connect(
                    &config.redis_url,
                    config.redis_pool_size,
                    Duration::from_millis(config.command_timeout_ms),
                )
                .await?;
                Ok(Backend::Redis(cache))
            }
            CacheBackend::Memory => {
                info!("Using in-process memory cache");
                Ok(Backend::Memory(MemoryCache::new()))
            }
        }
    }
}

impl CacheClient for Backend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self {
            Backend::Redis(cache) => cache.get(key).await,
            Backend::Memory(cache) => cache.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        match self {
            Backend::Redis(cache) => cache.set(key, value).await,
            Backend::Memory(cache) => cache.set(key, value).await,
        }
    }
}
