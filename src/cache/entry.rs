//! Cache Entry Module
//!
//! Per-key state: the last known value guarded by a monitor, the version used
//! to fence out superseded refreshes, and the timers attached to the key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Computes the delay until the next refresh from the last fetched value.
pub(crate) type DurationCalc<V> = Arc<dyn Fn(&V) -> Duration + Send + Sync>;

/// Version every entry starts at.
pub(crate) const INITIAL_VERSION: u64 = 0;

// == Entry State ==
/// Fields that change together under the entry lock.
#[derive(Debug)]
struct EntryState<V> {
    value: V,
    version: u64,
    updating: bool,
}

// == Cache Entry ==
/// A single cached key.
///
/// `value`, `version` and `updating` live behind one mutex; every transition
/// of `updating` is followed by a broadcast on `changed` so blocked readers
/// re-check the predicate.
pub struct CacheEntry<V> {
    state: Mutex<EntryState<V>>,
    changed: Notify,
    bound: AtomicBool,
    calculator: Mutex<Option<DurationCalc<V>>>,
    expiry_timer: Mutex<Option<AbortHandle>>,
    refresh_timer: Mutex<Option<AbortHandle>>,
}

impl<V: Clone> CacheEntry<V> {
    // == Constructors ==
    /// Creates an idle entry holding `value`.
    pub fn new(value: V) -> Self {
        Self::with_state(value, false)
    }

    /// Creates an entry seeded with a placeholder while its first fetch runs.
    pub fn loading(placeholder: V) -> Self {
        Self::with_state(placeholder, true)
    }

    fn with_state(value: V, updating: bool) -> Self {
        Self {
            state: Mutex::new(EntryState {
                value,
                version: INITIAL_VERSION,
                updating,
            }),
            changed: Notify::new(),
            bound: AtomicBool::new(false),
            calculator: Mutex::new(None),
            expiry_timer: Mutex::new(None),
            refresh_timer: Mutex::new(None),
        }
    }

    // == Observers ==
    /// Returns the current version.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Returns true while a fetch for this entry is in flight.
    pub fn is_updating(&self) -> bool {
        self.state.lock().updating
    }

    /// Returns the current value and version as one consistent pair.
    pub(crate) fn snapshot(&self) -> (V, u64) {
        let state = self.state.lock();
        (state.value.clone(), state.version)
    }

    // == Read ==
    /// Returns the current value.
    ///
    /// With `wait_for_update` set, waits until no fetch is in flight first.
    pub(crate) async fn read(&self, wait_for_update: bool) -> V {
        if !wait_for_update {
            return self.state.lock().value.clone();
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a broadcast between the check and
            // the await is not lost.
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if !state.updating {
                    return state.value.clone();
                }
            }
            notified.await;
        }
    }

    // == Writes ==
    /// Replaces the value unconditionally and returns the new version.
    ///
    /// Clears `updating`, so an in-flight fetch loses its claim on the entry.
    pub(crate) fn overwrite(&self, value: V) -> u64 {
        let version = {
            let mut state = self.state.lock();
            state.value = value;
            state.updating = false;
            state.version += 1;
            state.version
        };
        self.changed.notify_waiters();
        version
    }

    /// Marks the entry as updating if it is still at `version`.
    ///
    /// Returns false when a newer write has already superseded the caller.
    pub(crate) fn begin_refresh(&self, version: u64) -> bool {
        let mut state = self.state.lock();
        if state.version != version {
            return false;
        }
        state.updating = true;
        true
    }

    /// Installs a fetched value if the entry is still at `version`.
    ///
    /// Returns the new version, or `None` if the fetch was superseded.
    pub(crate) fn commit_refresh(&self, version: u64, value: V) -> Option<u64> {
        let committed = {
            let mut state = self.state.lock();
            if state.version != version {
                None
            } else {
                state.value = value;
                state.version += 1;
                state.updating = false;
                Some(state.version)
            }
        };
        if committed.is_some() {
            self.changed.notify_waiters();
        }
        committed
    }

    /// Releases a refresh claim without changing the value.
    pub(crate) fn abandon_refresh(&self, version: u64) {
        let released = {
            let mut state = self.state.lock();
            let claimed = state.version == version && state.updating;
            if claimed {
                state.updating = false;
            }
            claimed
        };
        if released {
            self.changed.notify_waiters();
        }
    }

    // == Refresh Binding ==
    /// Attaches a duration calculator unless one was ever attached before.
    ///
    /// Returns true for the single caller that wins the bind.
    pub(crate) fn try_bind(&self, calculator: DurationCalc<V>) -> bool {
        if self
            .bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.calculator.lock() = Some(calculator);
        true
    }

    /// Returns true once a calculator has been bound, even if later detached.
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    /// Returns the calculator if the refresh loop is still attached.
    pub(crate) fn calculator(&self) -> Option<DurationCalc<V>> {
        self.calculator.lock().clone()
    }

    /// Detaches the calculator and cancels the pending refresh timer.
    pub(crate) fn detach(&self) {
        self.calculator.lock().take();
        if let Some(timer) = self.refresh_timer.lock().take() {
            timer.abort();
        }
    }

    // == Timers ==
    /// Replaces the expiry timer, aborting the previous one.
    pub(crate) fn arm_expiry(&self, timer: AbortHandle) {
        if let Some(previous) = self.expiry_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Cancels any armed expiry timer.
    pub(crate) fn cancel_expiry(&self) {
        if let Some(previous) = self.expiry_timer.lock().take() {
            previous.abort();
        }
    }

    /// Replaces the refresh timer, aborting the previous one.
    pub(crate) fn arm_refresh(&self, timer: AbortHandle) {
        if let Some(previous) = self.refresh_timer.lock().replace(timer) {
            previous.abort();
        }
    }
}

impl<V> std::fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("version", &state.version)
            .field("updating", &state.updating)
            .field("bound", &self.bound.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new("value");
        assert_eq!(entry.snapshot(), ("value", INITIAL_VERSION));
        assert!(!entry.is_updating());
        assert!(!entry.is_bound());
    }

    #[test]
    fn test_loading_entry_is_updating() {
        let entry = CacheEntry::loading(0);
        assert!(entry.is_updating());
    }

    #[test]
    fn test_overwrite_bumps_version_and_clears_updating() {
        let entry = CacheEntry::loading(1);
        assert_eq!(entry.overwrite(2), 1);
        assert_eq!(entry.overwrite(3), 2);
        assert_eq!(entry.snapshot(), (3, 2));
        assert!(!entry.is_updating());
    }

    #[test]
    fn test_refresh_commit_at_current_version() {
        let entry = CacheEntry::new(1);
        assert!(entry.begin_refresh(0));
        assert!(entry.is_updating());
        assert_eq!(entry.commit_refresh(0, 2), Some(1));
        assert_eq!(entry.snapshot(), (2, 1));
        assert!(!entry.is_updating());
    }

    #[test]
    fn test_superseded_refresh_is_discarded() {
        let entry = CacheEntry::new(1);
        assert!(entry.begin_refresh(0));
        entry.overwrite(3);
        assert_eq!(entry.commit_refresh(0, 2), None);
        assert_eq!(entry.snapshot(), (3, 1));
    }

    #[test]
    fn test_begin_refresh_rejects_stale_version() {
        let entry = CacheEntry::new(1);
        entry.overwrite(2);
        assert!(!entry.begin_refresh(0));
        assert!(!entry.is_updating());
    }

    #[test]
    fn test_abandon_refresh_keeps_value() {
        let entry = CacheEntry::new(7);
        assert!(entry.begin_refresh(0));
        entry.abandon_refresh(0);
        assert!(!entry.is_updating());
        assert_eq!(entry.snapshot(), (7, 0));
    }

    #[test]
    fn test_bind_only_once() {
        let entry = CacheEntry::new(1u32);
        assert!(entry.try_bind(Arc::new(|_: &u32| Duration::from_millis(10))));
        assert!(!entry.try_bind(Arc::new(|_: &u32| Duration::from_millis(20))));

        let calc = entry.calculator().unwrap();
        assert_eq!(calc(&1), Duration::from_millis(10));

        entry.detach();
        assert!(entry.calculator().is_none());
        assert!(entry.is_bound());
        assert!(!entry.try_bind(Arc::new(|_: &u32| Duration::from_millis(30))));
    }

    #[tokio::test]
    async fn test_read_without_waiting_returns_placeholder() {
        let entry = CacheEntry::loading(1);
        assert_eq!(entry.read(false).await, 1);
    }

    #[tokio::test]
    async fn test_read_waits_for_commit() {
        let entry = Arc::new(CacheEntry::loading(1));

        let reader = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.read(true).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished(), "Reader should block while updating");

        assert_eq!(entry.commit_refresh(INITIAL_VERSION, 2), Some(1));
        assert_eq!(reader.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_abandon_releases_all_waiting_readers() {
        let entry = Arc::new(CacheEntry::new(5));
        assert!(entry.begin_refresh(0));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let entry = Arc::clone(&entry);
                tokio::spawn(async move { entry.read(true).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(30)).await;
        entry.abandon_refresh(0);

        for reader in readers {
            assert_eq!(reader.await.unwrap(), 5);
        }
    }
}
