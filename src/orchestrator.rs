//! Per-request cache-aside state machine.
//!
//! ```text
//! Received --decode--> CacheLookup --hit--> Respond --> Done
//!                           |
//!                          miss
//!                           v
//!                       Dispatch --> CacheStore --> Respond --> Done
//!
//! any failure --> Failed (logged, nothing written back)
//! ```
//!
//! Each request is independent. The only state shared between requests is
//! what the cache holds, and it is read and written without any
//! read-modify-write atomicity: two concurrent misses for the same integer
//! both dispatch a worker and both write the same answer.

use crate::cache::{CacheClient, CacheError};
use crate::protocol::{self, Answer, DecodeError};
use crate::worker::{Dispatcher, WorkerError};
use tracing::{debug, trace, warn};

/// What to do when writing a computed answer to the cache fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Log it and return the answer anyway
    #[default]
    Respond,
    /// Fail the request; nothing is written back
    Fail,
}

/// Reasons a request ends in `Failed`
#[derive(Debug)]
pub enum RequestError {
    Decode(DecodeError),
    CacheUnavailable(CacheError),
    Worker(WorkerError),
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Decode(e) => write!(f, "Decode error: {}", e),
            RequestError::CacheUnavailable(e) => write!(f, "{}", e),
            RequestError::Worker(e) => write!(f, "Worker failure: {}", e),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<DecodeError> for RequestError {
    fn from(e: DecodeError) -> Self {
        RequestError::Decode(e)
    }
}

impl From<CacheError> for RequestError {
    fn from(e: CacheError) -> Self {
        RequestError::CacheUnavailable(e)
    }
}

impl From<WorkerError> for RequestError {
    fn from(e: WorkerError) -> Self {
        RequestError::Worker(e)
    }
}

/// Drives requests through cache lookup, dispatch and cache store
pub struct Orchestrator<C, D> {
    cache: C,
    dispatcher: D,
    store_policy: StoreFailurePolicy,
}

impl<C: CacheClient, D: Dispatcher> Orchestrator<C, D> {
    pub fn new(cache: C, dispatcher: D) -> Self {
        Orchestrator {
            cache,
            dispatcher,
            store_policy: StoreFailurePolicy::default(),
        }
    }

    pub fn with_store_policy(mut self, store_policy: StoreFailurePolicy) -> Self {
        self.store_policy = store_policy;
        self
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Handle one inbound chunk, from decode to the answer to write back.
    pub async fn handle(&self, chunk: &[u8]) -> Result<Answer, RequestError> {
        let n = protocol::decode(chunk)?;
        trace!(n, "Request decoded");
        self.answer(n).await
    }

    /// Resolve the answer for `n`, computing and caching it on a miss.
    pub async fn answer(&self, n: u64) -> Result<Answer, RequestError> {
        let key = protocol::cache_key(n);

        if let Some(cached) = self.cache.get(&key).await? {
            match cached.parse::<Answer>() {
                Ok(answer) => {
                    debug!(n, %answer, "Cache hit");
                    return Ok(answer);
                }
                Err(e) => warn!(n, key = %key, error = %e, "Ignoring unreadable cache entry"),
            }
        }

        debug!(n, "Cache miss, dispatching worker");
        let answer = self.dispatcher.compute(n).await?;

        if let Err(e) = self.cache.set(&key, answer.as_str()).await {
            match self.store_policy {
                StoreFailurePolicy::Respond => {
                    warn!(n, key = %key, error = %e, "Cache store failed, responding anyway");
                }
                StoreFailurePolicy::Fail => return Err(e.into()),
            }
        }

        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio_test::{assert_err, assert_ok};

    /// Dispatcher computing in-process and recording every call
    #[derive(Default)]
    struct CountingDispatcher {
        calls: Mutex<Vec<u64>>,
        fail: bool,
    }

    impl CountingDispatcher {
        fn failing() -> Self {
            CountingDispatcher {
                fail: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<u64> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Dispatcher for CountingDispatcher {
        async fn compute(&self, n: u64) -> Result<Answer, WorkerError> {
            self.calls.lock().unwrap().push(n);
            if self.fail {
                return Err(WorkerError::NoReply(None));
            }
            Ok(Answer::from_is_prime(primes::is_prime(n)))
        }
    }

    /// Cache whose get and/or set can be switched off
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCache,
        get_down: bool,
        set_down: bool,
        gets: AtomicUsize,
    }

    impl CacheClient for FlakyCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.get_down {
                return Err(CacheError::Unavailable("connection refused".to_string()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
            if self.set_down {
                return Err(CacheError::Unavailable("connection refused".to_string()));
            }
            self.inner.set(key, value).await
        }
    }

    fn orchestrator() -> Orchestrator<MemoryCache, CountingDispatcher> {
        Orchestrator::new(MemoryCache::new(), CountingDispatcher::default())
    }

    #[tokio::test]
    async fn test_miss_dispatches_and_caches() {
        let orch = orchestrator();

        let answer = assert_ok!(orch.handle(&protocol::encode(17)).await);
        assert_eq!(answer, Answer::Prime);
        assert_eq!(orch.dispatcher().calls(), vec![17]);
        assert_eq!(
            orch.cache().get("primecache:17").await.unwrap().as_deref(),
            Some("prime")
        );
    }

    #[tokio::test]
    async fn test_composite_on_empty_cache() {
        let orch = orchestrator();
        assert_eq!(assert_ok!(orch.answer(18).await), Answer::Composite);
        assert_eq!(orch.dispatcher().calls(), vec![18]);
    }

    #[tokio::test]
    async fn test_second_request_is_a_hit() {
        let orch = orchestrator();
        assert_eq!(assert_ok!(orch.answer(17).await), Answer::Prime);
        assert_eq!(assert_ok!(orch.answer(17).await), Answer::Prime);
        assert_eq!(orch.dispatcher().calls(), vec![17]);
        assert_eq!(orch.cache().writes(), 1);
    }

    #[tokio::test]
    async fn test_first_request_matches_primality() {
        let orch = orchestrator();
        let small_primes = [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47];
        for n in 0..50u64 {
            let expected = Answer::from_is_prime(small_primes.contains(&n));
            assert_eq!(assert_ok!(orch.answer(n).await), expected, "n = {}", n);
        }
        assert_eq!(orch.dispatcher().calls(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_decode_failure_touches_nothing() {
        let orch = Orchestrator::new(FlakyCache::default(), CountingDispatcher::default());
        let err = assert_err!(orch.handle(b"").await);
        assert!(matches!(err, RequestError::Decode(DecodeError::Empty)));
        assert_eq!(orch.cache().gets.load(Ordering::SeqCst), 0);
        assert!(orch.dispatcher().calls().is_empty());
    }

    #[tokio::test]
    async fn test_cache_get_failure_skips_worker() {
        let cache = FlakyCache {
            get_down: true,
            ..Default::default()
        };
        let orch = Orchestrator::new(cache, CountingDispatcher::default());

        let err = assert_err!(orch.answer(19).await);
        assert!(matches!(err, RequestError::CacheUnavailable(_)));
        assert!(orch.dispatcher().calls().is_empty());
    }

    #[tokio::test]
    async fn test_worker_failure_leaves_cache_unchanged() {
        let orch = Orchestrator::new(MemoryCache::new(), CountingDispatcher::failing());

        let err = assert_err!(orch.answer(23).await);
        assert!(matches!(err, RequestError::Worker(_)));
        assert_eq!(orch.dispatcher().calls(), vec![23]);
        assert!(orch.cache().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_responds_by_default() {
        let cache = FlakyCache {
            set_down: true,
            ..Default::default()
        };
        let orch = Orchestrator::new(cache, CountingDispatcher::default());

        assert_eq!(assert_ok!(orch.answer(17).await), Answer::Prime);
        assert!(orch.cache().inner.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_can_fail_request() {
        let cache = FlakyCache {
            set_down: true,
            ..Default::default()
        };
        let orch = Orchestrator::new(cache, CountingDispatcher::default())
            .with_store_policy(StoreFailurePolicy::Fail);

        let err = assert_err!(orch.answer(17).await);
        assert!(matches!(err, RequestError::CacheUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_recomputed() {
        let orch = orchestrator();
        orch.cache().set("primecache:17", "maybe").await.unwrap();

        assert_eq!(assert_ok!(orch.answer(17).await), Answer::Prime);
        assert_eq!(orch.dispatcher().calls(), vec![17]);
        assert_eq!(
            orch.cache().get("primecache:17").await.unwrap().as_deref(),
            Some("prime")
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_agree() {
        let orch = Arc::new(orchestrator());

        let (a, b) = tokio::join!(orch.answer(97), orch.answer(97));
        assert_eq!(a.unwrap(), Answer::Prime);
        assert_eq!(b.unwrap(), Answer::Prime);
        assert_eq!(
            orch.cache().get("primecache:97").await.unwrap().as_deref(),
            Some("prime")
        );
        assert_eq!(orch.cache().len(), 1);
    }
}
