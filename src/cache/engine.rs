//! Cache Handle Module
//!
//! The public cache: store operations, first loads, and refresh-ahead loops.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, info};

use crate::cache::stats::StatsCounters;
use crate::cache::{CacheEntry, CacheStats, CacheStore, DurationCalc};
use crate::config::Config;
use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::tasks::expiry;
use crate::tasks::scheduler::{self, Fetcher, Scheduler, UpdateTask};

// == Shared State ==
/// State shared by every cache handle and its background tasks.
pub(crate) struct Shared<K, V> {
    pub(crate) store: CacheStore<K, V>,
    pub(crate) wait_on_update: bool,
    pub(crate) limiter: Option<Arc<RateLimiter>>,
    pub(crate) scheduler: Scheduler<K, V>,
    pub(crate) stats: StatsCounters,
}

impl<K, V> Drop for Shared<K, V> {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

// == Cache ==
/// In-process cache with TTL expiry and self-scheduling refresh-ahead.
///
/// Cloning yields another handle onto the same cache. Must be created inside
/// a tokio runtime: expiry timers, refresh timers and background fetches are
/// tokio tasks.
///
/// Keys must also implement `Debug` so they can be recorded on the
/// `tracing` events emitted for each key.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use refresh_cache::Cache;
///
/// # async fn example() {
/// let cache: Cache<&str, u64> = Cache::new(true);
/// cache.set("rate", 1, None);
/// cache.dynamic_update_later(
///     "rate",
///     |_| Duration::from_secs(30),
///     || async { Ok(2) },
/// );
/// assert!(cache.get(&"rate").await.is_some());
/// # }
/// ```
pub struct Cache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Constructors ==
    /// Creates a cache without a rate limit.
    ///
    /// With `wait_on_update`, `get` waits for an in-flight fetch to finish;
    /// otherwise it returns the last committed value immediately.
    pub fn new(wait_on_update: bool) -> Self {
        Self::build(wait_on_update, None)
    }

    /// Creates a cache from a validated configuration.
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        let limiter = config
            .rate_limit
            .map(RateLimiter::new)
            .transpose()?
            .map(Arc::new);
        Ok(Self::build(config.wait_on_update, limiter))
    }

    fn build(wait_on_update: bool, limiter: Option<Arc<RateLimiter>>) -> Self {
        let (scheduler, rx) = Scheduler::channel();
        let cancel = scheduler.token().clone();
        let rate_limited = limiter.is_some();

        let shared = Arc::new(Shared {
            store: CacheStore::new(),
            wait_on_update,
            limiter,
            scheduler,
            stats: StatsCounters::default(),
        });
        scheduler::spawn_worker(Arc::downgrade(&shared), rx, cancel);

        info!(wait_on_update, rate_limited, "Cache created");
        Self { shared }
    }

    // == Set ==
    /// Stores `value` under `key`, overwriting any existing value.
    ///
    /// An overwrite bumps the entry version, clears its updating flag and
    /// wakes blocked readers. `Some(ttl)` (re)arms expiry; `None` means the
    /// key never expires and cancels any armed expiry.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let shared = &self.shared;
        shared
            .store
            .upsert(key, value, |key, entry| expiry::arm(shared, key, entry, ttl));
    }

    // == Set If Not Exist ==
    /// Stores `value` only if `key` is absent. Returns true if it was stored.
    pub fn set_if_not_exist(&self, key: K, value: V, ttl: Option<Duration>) -> bool {
        let shared = &self.shared;
        shared
            .store
            .insert_if_absent(
                key,
                || CacheEntry::new(value),
                |key, entry| expiry::arm(shared, key, entry, ttl),
            )
            .is_some()
    }

    // == First Load ==
    /// Seeds an absent key with `default` and fetches its real value in the
    /// background, then returns the result of [`Cache::get`].
    ///
    /// If the key is already present nothing is inserted or fetched. A failed
    /// fetch leaves `default` in place.
    pub async fn first_load<F, Fut>(
        &self,
        key: K,
        default: V,
        fetch: F,
        ttl: Option<Duration>,
    ) -> Option<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let shared = &self.shared;
        let inserted = shared.store.insert_if_absent(
            key.clone(),
            || CacheEntry::loading(default),
            |key, entry| expiry::arm(shared, key, entry, ttl),
        );
        if let Some(entry) = inserted {
            debug!(key = ?key, "First load started");
            scheduler::spawn_first_load(shared, key.clone(), &entry, fetch);
        }

        self.get(&key).await
    }

    // == Get ==
    /// Returns the value for `key`, or `None` if absent.
    ///
    /// Waits while a fetch is in flight if the cache was built with
    /// `wait_on_update`.
    pub async fn get(&self, key: &K) -> Option<V> {
        let Some(entry) = self.shared.store.get(key) else {
            self.shared.stats.record_miss();
            return None;
        };
        self.shared.stats.record_hit();
        Some(entry.read(self.shared.wait_on_update).await)
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.shared.store.contains(key)
    }

    /// Returns the number of entries.
    pub fn size(&self) -> usize {
        self.shared.store.len()
    }

    /// Removes `key`. Returns true if it was present.
    ///
    /// Timers of the removed entry stay armed and do nothing when they fire.
    pub fn remove(&self, key: &K) -> bool {
        self.shared.store.remove(key).is_some()
    }

    /// Returns the current version of `key`'s entry.
    pub fn version(&self, key: &K) -> Option<u64> {
        self.shared.store.get(key).map(|entry| entry.version())
    }

    // == Refresh-Ahead ==
    /// Starts a refresh loop for an existing key.
    ///
    /// The first refresh runs after `calc(current value)`; each later one
    /// after `calc` of the value in place once the previous cycle ends. A
    /// write to the key before a cycle installs ends the loop. A key can be
    /// bound at most once: later calls, and calls on missing keys or a
    /// stopped cache, return false and change nothing.
    pub fn dynamic_update_later<C, F, Fut>(&self, key: K, calc: C, fetch: F) -> bool
    where
        C: Fn(&V) -> Duration + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if self.is_stopped() {
            return false;
        }
        let Some(entry) = self.shared.store.get(&key) else {
            return false;
        };

        let calc: DurationCalc<V> = Arc::new(calc);
        if !entry.try_bind(Arc::clone(&calc)) {
            debug!(key = ?key, "Refresh loop already bound");
            return false;
        }

        let (value, version) = entry.snapshot();
        let fetch: Fetcher<V> = Arc::new(move || fetch().boxed());
        let task = UpdateTask {
            delay: calc(&value),
            key,
            fetch,
            entry: Arc::downgrade(&entry),
            version,
        };
        self.shared.scheduler.submit(task)
    }

    /// Starts a refresh loop with a fixed interval between cycles.
    pub fn update_later<F, Fut>(&self, key: K, interval: Duration, fetch: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.dynamic_update_later(key, move |_| interval, fetch)
    }

    /// Detaches `key`'s refresh loop and cancels its pending timer.
    ///
    /// A fetch that already started still runs to completion.
    pub fn stop_later_update(&self, key: &K) {
        if let Some(entry) = self.shared.store.get(key) {
            entry.detach();
            debug!(key = ?key, "Refresh loop stopped");
        }
    }

    // == Lifecycle ==
    /// Stops the scheduler worker and every pending refresh.
    ///
    /// Store operations and TTL expiry keep working; no refresh runs again.
    pub fn stop(&self) {
        self.shared.scheduler.stop();
    }

    /// Returns true after [`Cache::stop`].
    pub fn is_stopped(&self) -> bool {
        self.shared.scheduler.is_stopped()
    }

    /// Returns a snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot(self.shared.store.len())
    }
}
