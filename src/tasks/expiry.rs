//! TTL Expiry Timers
//!
//! One deferred removal per entry, re-armed on every write that carries a TTL.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::debug;

use crate::cache::{CacheEntry, Shared};

/// Arms, replaces, or cancels the expiry timer of `entry`.
///
/// `None` means the entry never expires and cancels any armed timer. The
/// timer removes the key only if it still maps to this same entry.
pub(crate) fn arm<K, V>(
    shared: &Arc<Shared<K, V>>,
    key: &K,
    entry: &Arc<CacheEntry<V>>,
    ttl: Option<Duration>,
) where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    match ttl {
        None => entry.cancel_expiry(),
        Some(ttl) => {
            let timer = spawn_expiry(Arc::downgrade(shared), key.clone(), Arc::downgrade(entry), ttl);
            entry.arm_expiry(timer.abort_handle());
        }
    }
}

fn spawn_expiry<K, V>(
    shared: Weak<Shared<K, V>>,
    key: K,
    entry: Weak<CacheEntry<V>>,
    ttl: Duration,
) -> tokio::task::JoinHandle<()>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;

        let (Some(shared), Some(entry)) = (shared.upgrade(), entry.upgrade()) else {
            return;
        };
        if shared.store.remove_if_same(&key, &entry) {
            shared.stats.record_expiration();
            debug!(key = ?key, ttl = ?ttl, "Entry expired");
        }
    })
}
