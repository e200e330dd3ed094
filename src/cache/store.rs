//! Cache Store Module
//!
//! Key to entry mapping guarded by a reader/writer lock.

use std::collections::hash_map::{Entry as MapEntry, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::CacheEntry;

// == Cache Store ==
/// Owns the shape of the key space.
///
/// The lock covers insert, delete and lookup only. Entry fields are guarded
/// by each entry's own monitor; when both are held, the store lock is always
/// taken first.
#[derive(Debug)]
pub struct CacheStore<K, V> {
    entries: RwLock<HashMap<K, Arc<CacheEntry<V>>>>,
}

impl<K, V> CacheStore<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    // == Constructor ==
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    // == Upsert ==
    /// Inserts `value` or overwrites the existing entry's value.
    ///
    /// `on_write` runs while the store lock is still held, so timer arming is
    /// ordered with the write it belongs to. Returns true if a new entry was
    /// created.
    pub fn upsert(
        &self,
        key: K,
        value: V,
        on_write: impl FnOnce(&K, &Arc<CacheEntry<V>>),
    ) -> bool {
        let mut entries = self.entries.write();
        match entries.entry(key) {
            MapEntry::Occupied(occupied) => {
                occupied.get().overwrite(value);
                on_write(occupied.key(), occupied.get());
                false
            }
            MapEntry::Vacant(vacant) => {
                let entry = Arc::new(CacheEntry::new(value));
                on_write(vacant.key(), &entry);
                vacant.insert(entry);
                true
            }
        }
    }

    // == Insert If Absent ==
    /// Inserts the entry built by `make` unless the key is present.
    ///
    /// Returns the inserted entry, or `None` if the key already existed.
    pub fn insert_if_absent(
        &self,
        key: K,
        make: impl FnOnce() -> CacheEntry<V>,
        on_insert: impl FnOnce(&K, &Arc<CacheEntry<V>>),
    ) -> Option<Arc<CacheEntry<V>>> {
        let mut entries = self.entries.write();
        match entries.entry(key) {
            MapEntry::Occupied(_) => None,
            MapEntry::Vacant(vacant) => {
                let entry = Arc::new(make());
                on_insert(vacant.key(), &entry);
                vacant.insert(Arc::clone(&entry));
                Some(entry)
            }
        }
    }

    // == Lookup ==
    /// Returns the entry for `key`.
    pub fn get(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        self.entries.read().get(key).cloned()
    }

    /// Returns true if `key` maps to this exact entry.
    pub fn holds(&self, key: &K, entry: &Arc<CacheEntry<V>>) -> bool {
        self.entries
            .read()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    // == Remove ==
    /// Removes `key`, returning its entry.
    pub fn remove(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        self.entries.write().remove(key)
    }

    /// Removes `key` only if it still maps to `entry`.
    ///
    /// Timers belonging to a removed entry use this so they never touch an
    /// entry later inserted under the same key.
    pub fn remove_if_same(&self, key: &K, entry: &Arc<CacheEntry<V>>) -> bool {
        let mut entries = self.entries.write();
        let same = entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if same {
            entries.remove(key);
        }
        same
    }

    // == Length ==
    /// Returns the current number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K, V> Default for CacheStore<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
