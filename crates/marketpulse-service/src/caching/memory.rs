use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::CacheKey;
use crate::config::CacheSettings;
use crate::error::FetchResult;
use crate::utils::futures::{CallOnDrop, m, measure};

type ComputationFuture<V> = BoxFuture<'static, FetchResult<V>>;
type ComputationChannel<V> = Shared<ComputationFuture<V>>;
type LookupFn<R, V> = dyn Fn(R) -> ComputationFuture<V> + Send + Sync;

/// A request that can be looked up through a [`Cacher`].
pub trait CacheRequest: Send + 'static {
    /// Returns the key by which the result of this request is cached.
    fn cache_key(&self) -> CacheKey;
}

/// A value held by a [`Cacher`].
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    pub value: V,
    pub computed_at: Instant,
    pub expires_at: Instant,
    pub access_count: u64,
    pub last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Marker for a lookup that has not resolved yet.
///
/// Only a weak handle is kept, the computation is owned by its waiters. Once the last waiter goes
/// away, the computation is dropped and removes its marker.
struct InFlightComputation<V> {
    channel: WeakShared<ComputationFuture<V>>,
    started_at: Instant,
    generation: u64,
}

/// A value returned by [`Cacher::get_or_stale`].
#[derive(Debug, Clone, PartialEq)]
pub struct MaybeStale<V> {
    pub value: V,
    /// The value is a leftover of an earlier successful lookup, the latest lookup failed.
    pub is_stale: bool,
}

/// Counters of a single [`Cacher`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub computations: u64,
    pub failures: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct CacheState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    current_computations: HashMap<CacheKey, InFlightComputation<V>>,
    stats: CacheStats,
}

struct CacherInner<R, V> {
    name: &'static str,
    settings: CacheSettings,
    lookup: Box<LookupFn<R, V>>,
    state: Mutex<CacheState<V>>,
    next_generation: AtomicU64,
}

/// An in-memory, TTL-bound cache that deduplicates concurrent lookups.
///
/// For every key, a [`get`](Self::get) either returns a fresh entry, attaches to the lookup that
/// is currently running for that key, or starts exactly one new lookup. Failed lookups are never
/// stored.
///
/// Cloning a `Cacher` is cheap, all clones share the same entries.
pub struct Cacher<R, V> {
    inner: Arc<CacherInner<R, V>>,
}

impl<R, V> Clone for Cacher<R, V> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, V> std::fmt::Debug for Cacher<R, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cacher")
            .field("name", &self.inner.name)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl<R, V> Cacher<R, V>
where
    R: CacheRequest,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache computing missing values with `lookup`.
    ///
    /// The `name` is used for logs and as the `cache` tag of all metrics.
    pub fn new<F, Fut>(name: &'static str, settings: CacheSettings, lookup: F) -> Self
    where
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let stats = CacheStats {
            name,
            ..Default::default()
        };

        Self {
            inner: Arc::new(CacherInner {
                name,
                settings,
                lookup: Box::new(move |request| lookup(request).boxed()),
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    current_computations: HashMap::new(),
                    stats,
                }),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Returns the cached value for `request`, computing it if needed.
    pub async fn get(&self, request: R) -> FetchResult<V> {
        let name = self.inner.name;
        let key = request.cache_key();
        metric!(counter("caches.access") += 1, "cache" => name);

        let channel = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            if let Some(entry) = state.entries.get_mut(&key).filter(|e| e.is_fresh(now)) {
                entry.access_count += 1;
                entry.last_accessed = now;
                let value = entry.value.clone();
                state.stats.hits += 1;
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                return Ok(value);
            }

            state.stats.misses += 1;
            self.inner.attach_or_start(&mut state, key, request)
        };

        channel.await
    }

    /// Like [`get`](Self::get), but falls back to the last stored value if the lookup fails.
    ///
    /// Expired values are only available until they are swept or evicted.
    pub async fn get_or_stale(&self, request: R) -> FetchResult<MaybeStale<V>> {
        let key = request.cache_key();
        match self.get(request).await {
            Ok(value) => Ok(MaybeStale {
                value,
                is_stale: false,
            }),
            Err(err) => {
                let state = self.inner.state.lock();
                match state.entries.get(&key) {
                    Some(entry) => {
                        tracing::debug!(
                            cache = self.inner.name,
                            %key,
                            error = %err,
                            "Serving stale value after failed lookup"
                        );
                        Ok(MaybeStale {
                            value: entry.value.clone(),
                            is_stale: !entry.is_fresh(Instant::now()),
                        })
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Recomputes the value for `request`, regardless of whether a fresh one is cached.
    ///
    /// If a lookup for the same key is already running, this attaches to it instead.
    pub async fn refresh(&self, request: R) -> FetchResult<V> {
        let key = request.cache_key();
        let channel = {
            let mut state = self.inner.state.lock();
            self.inner.attach_or_start(&mut state, key, request)
        };
        channel.await
    }

    /// Returns a fresh value for `key` without starting any work.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| entry.is_fresh(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    /// Returns a copy of the entry for `key`, including its access bookkeeping.
    ///
    /// Expired entries are returned until they are swept. This does not count as an access.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.inner.state.lock().entries.get(key).cloned()
    }

    /// Removes the entry for `key` and detaches a running lookup.
    ///
    /// A detached lookup still resolves for its current waiters, but never writes its result.
    /// Returns `true` if there was anything to remove.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut state = self.inner.state.lock();
        let removed_entry = state.entries.remove(key).is_some();
        let removed_computation = state.current_computations.remove(key).is_some();
        removed_entry || removed_computation
    }

    /// Removes all entries and detaches all running lookups.
    pub fn invalidate_all(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.current_computations.clear();
    }

    /// Removes all expired entries and returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Spawns a task on the current runtime that sweeps expired entries every `interval`.
    ///
    /// The task stops once all clones of this cache have been dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(sweep_periodically(inner, interval))
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.entries.len(),
            in_flight: state.current_computations.len(),
            ..state.stats
        }
    }
}

async fn sweep_periodically<R, V>(inner: Weak<CacherInner<R, V>>, interval: Duration)
where
    R: CacheRequest,
    V: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sweep();
    }
}

impl<R, V> CacherInner<R, V>
where
    R: CacheRequest,
    V: Clone + Send + Sync + 'static,
{
    /// Returns the channel of the running lookup for `key`, or starts a new one.
    ///
    /// Must be called with the state lock held, so that checking for and registering a
    /// computation happens atomically.
    fn attach_or_start(
        self: &Arc<Self>,
        state: &mut CacheState<V>,
        key: CacheKey,
        request: R,
    ) -> ComputationChannel<V> {
        let existing = state
            .current_computations
            .get(&key)
            .and_then(|computation| computation.channel.upgrade());
        if let Some(channel) = existing {
            state.stats.coalesced += 1;
            metric!(counter("caches.channel.hit") += 1, "cache" => self.name);
            return channel;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let computation = Arc::clone(self)
            .compute(key.clone(), request, generation)
            .bind_hub(Hub::new_from_top(Hub::current()));
        let channel = computation.boxed().shared();

        if let Some(weak) = channel.downgrade() {
            state.current_computations.insert(
                key,
                InFlightComputation {
                    channel: weak,
                    started_at: Instant::now(),
                    generation,
                },
            );
        }
        state.stats.computations += 1;
        metric!(counter("caches.computation") += 1, "cache" => self.name);

        channel
    }

    /// Runs the lookup and stores its result, unless the computation was detached meanwhile.
    async fn compute(self: Arc<Self>, key: CacheKey, request: R, generation: u64) -> FetchResult<V> {
        // Removes the marker if this future is dropped before completion, which happens once all
        // waiters are gone.
        let remove_computation_token = {
            let inner = Arc::clone(&self);
            let key = key.clone();
            CallOnDrop::new(move || {
                let mut state = inner.state.lock();
                if state
                    .current_computations
                    .get(&key)
                    .is_some_and(|c| c.generation == generation)
                {
                    tracing::trace!(cache = inner.name, %key, "Dropping abandoned computation");
                    state.current_computations.remove(&key);
                }
            })
        };

        let result = measure(self.name, m::result, (self.lookup)(request)).await;

        {
            let mut state = self.state.lock();
            let is_current = state
                .current_computations
                .get(&key)
                .is_some_and(|c| c.generation == generation);

            if is_current {
                if let Some(computation) = state.current_computations.remove(&key) {
                    tracing::trace!(
                        cache = self.name,
                        %key,
                        elapsed = ?computation.started_at.elapsed(),
                        "Computation finished"
                    );
                }
            } else {
                tracing::debug!(cache = self.name, %key, "Discarding result of detached computation");
            }

            match &result {
                Ok(value) if is_current => self.insert(&mut state, key, value.clone()),
                Ok(_) => {}
                Err(err) => {
                    state.stats.failures += 1;
                    tracing::debug!(cache = self.name, error = %err, "Lookup failed");
                }
            }
        }

        // The marker is gone already, so this is a no-op.
        drop(remove_computation_token);
        result
    }

    fn insert(&self, state: &mut CacheState<V>, key: CacheKey, value: V) {
        let capacity = self.settings.capacity.max(1);
        if !state.entries.contains_key(&key) && state.entries.len() >= capacity {
            self.evict(state, capacity);
        }

        let now = Instant::now();
        let entry = CacheEntry {
            key: key.clone(),
            value,
            computed_at: now,
            expires_at: now + self.settings.ttl,
            access_count: 0,
            last_accessed: now,
        };
        state.entries.insert(key, entry);
    }

    /// Evicts the least recently used entries, oldest computation first on ties.
    fn evict(&self, state: &mut CacheState<V>, capacity: usize) {
        let fraction = self.settings.eviction_fraction.clamp(0.0, 1.0);
        let count = ((capacity as f64 * fraction).ceil() as usize)
            .max(1)
            .min(state.entries.len());

        let mut candidates: Vec<_> = state
            .entries
            .values()
            .map(|entry| (entry.last_accessed, entry.computed_at, entry.key.clone()))
            .collect();
        candidates.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, key) in candidates.into_iter().take(count) {
            state.entries.remove(&key);
        }

        state.stats.evictions += count as u64;
        metric!(counter("caches.evicted") += count as i64, "cache" => self.name);
    }

    fn sweep(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh(now));
        let expired = before - state.entries.len();

        if expired > 0 {
            state.stats.expirations += expired as u64;
            metric!(counter("caches.expired") += expired as i64, "cache" => self.name);
            tracing::trace!(cache = self.name, expired, "Swept expired entries");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use crate::error::FetchError;

    use super::*;

    #[derive(Clone, Debug)]
    struct TestRequest(&'static str);

    impl CacheRequest for TestRequest {
        fn cache_key(&self) -> CacheKey {
            key(self.0)
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::builder("test").param("name", name).build()
    }

    fn settings(ttl: Duration) -> CacheSettings {
        CacheSettings {
            ttl,
            capacity: 100,
            eviction_fraction: 0.2,
        }
    }

    /// A cache that sleeps for `delay` and returns the number of lookups made so far.
    fn counting_cache(
        settings: CacheSettings,
        delay: Duration,
    ) -> (Cacher<TestRequest, usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = {
            let calls = Arc::clone(&calls);
            Cacher::new("test", settings, move |_request: TestRequest| {
                let calls = Arc::clone(&calls);
                async move {
                    tokio::time::sleep(delay).await;
                    Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
                }
            })
        };
        (cache, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_share_one_lookup() {
        let (cache, calls) = counting_cache(settings(Duration::from_secs(30)), Duration::from_secs(1));

        let results =
            futures::future::join_all((0..10).map(|_| cache.get(TestRequest("btc")))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|result| *result == Ok(1)));

        let stats = cache.stats();
        assert_eq!(stats.computations, 1);
        assert_eq!(stats.coalesced, 9);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_exactly_at_ttl() {
        let (cache, calls) = counting_cache(settings(Duration::from_secs(30)), Duration::ZERO);

        assert_eq!(cache.get(TestRequest("btc")).await, Ok(1));

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert_eq!(cache.get(TestRequest("btc")).await, Ok(1));
        assert_eq!(cache.peek(&key("btc")), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.peek(&key("btc")), None);
        assert_eq!(cache.get(TestRequest("btc")).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = {
            let calls = Arc::clone(&calls);
            Cacher::new(
                "test",
                settings(Duration::from_secs(30)),
                move |_request: TestRequest| {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        match attempt {
                            0 => Err(FetchError::Network("connection reset".into())),
                            n => Ok(n),
                        }
                    }
                },
            )
        };

        assert!(cache.get(TestRequest("eth")).await.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().in_flight, 0);

        assert_eq!(cache.get(TestRequest("eth")).await, Ok(1));
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_replaces_fresh_entry() {
        let (cache, calls) = counting_cache(settings(Duration::from_secs(30)), Duration::ZERO);

        assert_eq!(cache.get(TestRequest("sol")).await, Ok(1));
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(cache.refresh(TestRequest("sol")).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // the refresh reset the expiration
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.get(TestRequest("sol")).await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_tracks_accesses() {
        let (cache, _) = counting_cache(settings(Duration::from_secs(30)), Duration::ZERO);
        assert!(cache.entry(&key("ada")).is_none());

        cache.get(TestRequest("ada")).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.get(TestRequest("ada")).await.unwrap();
        cache.get(TestRequest("ada")).await.unwrap();
        cache.peek(&key("ada"));

        let entry = cache.entry(&key("ada")).unwrap();
        assert_eq!(entry.value, 1);
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed - entry.computed_at, Duration::from_secs(5));
        assert_eq!(entry.expires_at - entry.computed_at, Duration::from_secs(30));

        // a recomputation starts a fresh entry
        cache.refresh(TestRequest("ada")).await.unwrap();
        let entry = cache.entry(&key("ada")).unwrap();
        assert_eq!(entry.value, 2);
        assert_eq!(entry.access_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_attaches_to_running_lookup() {
        let (cache, calls) = counting_cache(settings(Duration::from_secs(30)), Duration::from_secs(1));

        let (a, b) = tokio::join!(cache.get(TestRequest("sol")), cache.refresh(TestRequest("sol")));

        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_detaches_running_lookup() {
        let (cache, calls) = counting_cache(settings(Duration::from_secs(30)), Duration::from_secs(1));

        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(TestRequest("doge")).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.stats().in_flight, 1);

        assert!(cache.invalidate(&key("doge")));

        // the waiter still receives the detached result, but it is never stored
        assert_eq!(waiter.await.unwrap(), Ok(1));
        assert!(cache.is_empty());

        assert_eq!(cache.get(TestRequest("doge")).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_lookup_is_dropped() {
        let finished = Arc::new(AtomicBool::new(false));
        let cache = {
            let finished = Arc::clone(&finished);
            Cacher::new(
                "test",
                settings(Duration::from_secs(30)),
                move |_request: TestRequest| {
                    let finished = Arc::clone(&finished);
                    async move {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(1)
                    }
                },
            )
        };

        let result =
            tokio::time::timeout(Duration::from_secs(1), cache.get(TestRequest("btc"))).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(cache.stats().in_flight, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_prefers_least_recently_used() {
        let settings = CacheSettings {
            ttl: Duration::from_secs(3600),
            capacity: 5,
            eviction_fraction: 0.4,
        };
        let (cache, _calls) = counting_cache(settings, Duration::ZERO);

        for name in ["a", "b", "c", "d", "e"] {
            cache.get(TestRequest(name)).await.unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        // touch `a` and `b`, leaving `c` and `d` as least recently used
        cache.get(TestRequest("a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get(TestRequest("b")).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;

        cache.get(TestRequest("f")).await.unwrap();

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().evictions, 2);
        for name in ["a", "b", "e", "f"] {
            assert!(cache.peek(&key(name)).is_some(), "{name} should be cached");
        }
        for name in ["c", "d"] {
            assert!(cache.peek(&key(name)).is_none(), "{name} should be evicted");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let (cache, _calls) = counting_cache(settings(Duration::from_secs(30)), Duration::ZERO);
        let sweeper = cache.spawn_sweeper(Duration::from_secs(10));

        cache.get(TestRequest("btc")).await.unwrap();
        cache.get(TestRequest("eth")).await.unwrap();
        assert_eq!(cache.len(), 2);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 2);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_stale_serves_expired_value() {
        let fail = Arc::new(AtomicBool::new(false));
        let cache = {
            let fail = Arc::clone(&fail);
            Cacher::new(
                "test",
                settings(Duration::from_secs(30)),
                move |_request: TestRequest| {
                    let fail = fail.load(Ordering::SeqCst);
                    async move {
                        if fail {
                            Err(FetchError::Http {
                                status: 503,
                                message: "unavailable".into(),
                            })
                        } else {
                            Ok(42)
                        }
                    }
                },
            )
        };

        let fresh = cache.get_or_stale(TestRequest("btc")).await.unwrap();
        assert!(!fresh.is_stale);

        fail.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(cache.get(TestRequest("btc")).await.is_err());
        let stale = cache.get_or_stale(TestRequest("btc")).await.unwrap();
        assert_eq!(
            stale,
            MaybeStale {
                value: 42,
                is_stale: true
            }
        );

        assert!(cache.get_or_stale(TestRequest("eth")).await.is_err());
    }
}
