//! Refresh Scheduler
//!
//! A single worker receives refresh tasks, arms one timer per task, and when a
//! timer fires runs the fetch in its own task. Each task carries the entry
//! version it was created against; a task whose entry moved past that version
//! installs nothing and ends its loop.

use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, Shared, INITIAL_VERSION};
use crate::error::CacheError;

/// Type-erased fetch function shared by every cycle of a refresh loop.
pub(crate) type Fetcher<V> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;

// == Update Task ==
/// One pending refresh: fetch `key` after `delay` if it is still at `version`.
pub(crate) struct UpdateTask<K, V> {
    pub(crate) key: K,
    pub(crate) delay: Duration,
    pub(crate) fetch: Fetcher<V>,
    pub(crate) entry: Weak<CacheEntry<V>>,
    pub(crate) version: u64,
}

// == Scheduler Handle ==
/// Sending half of the refresh worker plus its shutdown token.
pub(crate) struct Scheduler<K, V> {
    tx: mpsc::UnboundedSender<UpdateTask<K, V>>,
    cancel: CancellationToken,
}

impl<K, V> Scheduler<K, V> {
    /// Creates the handle and the receiver the worker will drain.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<UpdateTask<K, V>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            tx,
            cancel: CancellationToken::new(),
        };
        (scheduler, rx)
    }

    /// Queues a task. Returns false once the scheduler has stopped.
    pub(crate) fn submit(&self, task: UpdateTask<K, V>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(task).is_ok()
    }

    /// Token cancelled by `stop`, observed by timers and limiter waits.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// == Worker ==
/// Spawns the worker that arms a timer for every queued task.
///
/// The worker holds only a weak reference to the cache and exits when the
/// cache is stopped or dropped.
pub(crate) fn spawn_worker<K, V>(
    shared: Weak<Shared<K, V>>,
    mut rx: mpsc::UnboundedReceiver<UpdateTask<K, V>>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        debug!("Refresh scheduler started");

        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let Some(shared) = shared.upgrade() else {
                break;
            };
            arm(&shared, task);
        }

        info!("Refresh scheduler stopped");
    })
}

/// Returns the task's entry if the store still maps its key to it.
fn live_entry<K, V>(shared: &Shared<K, V>, task: &UpdateTask<K, V>) -> Option<Arc<CacheEntry<V>>>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let entry = task.entry.upgrade()?;
    shared.store.holds(&task.key, &entry).then_some(entry)
}

fn arm<K, V>(shared: &Arc<Shared<K, V>>, task: UpdateTask<K, V>)
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let Some(entry) = live_entry(shared, &task) else {
        debug!(key = ?task.key, "Key removed before its refresh was armed");
        return;
    };
    if entry.calculator().is_none() {
        debug!(key = ?task.key, "Refresh loop detached, not arming");
        return;
    }

    debug!(key = ?task.key, version = task.version, delay = ?task.delay, "Arming refresh");

    let weak = Arc::downgrade(shared);
    let cancel = shared.scheduler.token().clone();
    let delay = task.delay;
    let timer = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        // Run the fetch detached from the timer so aborting the timer never
        // aborts a fetch that already started.
        tokio::spawn(refresh(weak, task));
    });
    entry.arm_refresh(timer.abort_handle());
}

// == Refresh ==
async fn refresh<K, V>(shared: Weak<Shared<K, V>>, task: UpdateTask<K, V>)
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let Some(shared) = shared.upgrade() else {
        return;
    };
    if shared.scheduler.is_stopped() {
        return;
    }
    let Some(entry) = live_entry(&shared, &task) else {
        debug!(key = ?task.key, "Key removed, dropping refresh");
        return;
    };
    if entry.calculator().is_none() {
        debug!(key = ?task.key, "Refresh loop detached, dropping refresh");
        return;
    }

    if !entry.begin_refresh(task.version) {
        shared.stats.record_stale_skip();
        debug!(
            key = ?task.key,
            task_version = task.version,
            current_version = entry.version(),
            "Refresh superseded by a newer write, ending loop"
        );
        return;
    }

    if let Some(limiter) = &shared.limiter {
        if !limiter.wait(shared.scheduler.token()).await {
            entry.abandon_refresh(task.version);
            return;
        }
    }

    let fetch = Arc::clone(&task.fetch);
    match run_fetch(async move { fetch().await }).await {
        Ok(value) => match entry.commit_refresh(task.version, value) {
            Some(version) => {
                shared.stats.record_refresh();
                debug!(key = ?task.key, version, "Refreshed entry");
            }
            None => {
                shared.stats.record_stale_skip();
                debug!(
                    key = ?task.key,
                    "Discarding fetched value, entry was overwritten; ending loop"
                );
                return;
            }
        },
        Err(err) => {
            let err = CacheError::from(err);
            shared.stats.record_refresh_failure();
            warn!(key = ?task.key, error = %err, "Refresh failed, keeping last value");
            entry.abandon_refresh(task.version);
        }
    }

    reschedule(&shared, &entry, task);
}

/// Queues the next cycle from the entry's current value and version.
///
/// Ends the loop if the key was removed, the calculator was detached or the
/// scheduler stopped.
fn reschedule<K, V>(shared: &Shared<K, V>, entry: &Arc<CacheEntry<V>>, task: UpdateTask<K, V>)
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    if shared.scheduler.is_stopped() || !shared.store.holds(&task.key, entry) {
        return;
    }
    let Some(calculator) = entry.calculator() else {
        debug!(key = ?task.key, "Refresh loop detached");
        return;
    };

    let (value, version) = entry.snapshot();
    let delay = calculator(&value);
    shared.scheduler.submit(UpdateTask {
        delay,
        version,
        ..task
    });
}

// == First Load ==
/// Runs the first fetch for an entry seeded with a placeholder.
///
/// The result is installed only if nothing wrote to the entry meanwhile.
pub(crate) fn spawn_first_load<K, V, F, Fut>(
    shared: &Shared<K, V>,
    key: K,
    entry: &Arc<CacheEntry<V>>,
    fetch: F,
) -> JoinHandle<()>
where
    K: Debug + Send + 'static,
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    let limiter = shared.limiter.clone();
    let cancel = shared.scheduler.token().clone();
    let entry = Arc::downgrade(entry);

    tokio::spawn(async move {
        if let Some(limiter) = limiter {
            if !limiter.wait(&cancel).await {
                if let Some(entry) = entry.upgrade() {
                    entry.abandon_refresh(INITIAL_VERSION);
                }
                return;
            }
        }

        let result = run_fetch(async move { fetch().await }).await;
        let Some(entry) = entry.upgrade() else {
            return;
        };
        match result {
            Ok(value) => {
                if entry.commit_refresh(INITIAL_VERSION, value).is_none() {
                    debug!(key = ?key, "First load superseded by a newer write");
                }
            }
            Err(err) => {
                let err = CacheError::from(err);
                warn!(key = ?key, error = %err, "First load failed, keeping default value");
                entry.abandon_refresh(INITIAL_VERSION);
            }
        }
    })
}

// == Fetch Guard ==
/// Awaits a caller-supplied fetch, turning a panic into an error.
async fn run_fetch<V, Fut>(fetch: Fut) -> anyhow::Result<V>
where
    Fut: Future<Output = anyhow::Result<V>>,
{
    match AssertUnwindSafe(fetch).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("fetch panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_fetch_passes_results_through() {
        assert_eq!(run_fetch::<i32, _>(async { Ok(3) }).await.unwrap(), 3);
        assert!(run_fetch::<i32, _>(async { Err(anyhow!("down")) }).await.is_err());
    }

    #[tokio::test]
    async fn test_run_fetch_converts_panic_to_error() {
        let err = run_fetch::<i32, _>(async {
            if true {
                panic!("backend exploded");
            }
            Ok(0)
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("backend exploded"));
    }
}
