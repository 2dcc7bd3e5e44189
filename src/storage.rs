//! In-process key-value store.
//!
//! Provides the cache contract without an external server:
//! - `get` returns `None` for absent keys
//! - `set` overwrites unconditionally
//!
//! Handles are cheap to clone and share one map.

use crate::cache::{CacheClient, CacheError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

#[derive(Debug, Default)]
struct Inner {
    data: RwLock<HashMap<String, String>>,
    /// Number of `set` calls served, including overwrites
    writes: AtomicU64,
}

/// Thread-safe in-memory cache
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.inner.data.read().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total `set` calls served
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, CacheError> {
        let data = self
            .inner
            .data
            .read()
            .map_err(|_| CacheError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut data = self
            .inner
            .data
            .write()
            .map_err(|_| CacheError::Unavailable("memory store lock poisoned".to_string()))?;
        data.insert(key.to_string(), value.to_string());
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        trace!(key, value, items = data.len(), "Item stored");
        Ok(())
    }
}

impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.lookup(key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.store(key, value)
    }
}
