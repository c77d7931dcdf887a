//! Reference-counted interning store
//!
//! Every registry in this crate (client records, owners, NSM/NLM entries)
//! needs the same shape: a concurrent map where identical keys always resolve
//! to the same live object, objects are kept alive by explicit references,
//! and an object is removed exactly once, only after its last reference is
//! gone. [`RefCountedStore`] implements that shape once.
//!
//! The delicate part is the release/get race. A releasing thread that drops
//! the count to zero must re-check, under the map's shard lock, that the
//! entry it is about to remove is still the same object and still at zero —
//! a concurrent `get_or_create` may have resurrected it in the meantime, in
//! which case removal is abandoned and the entry stays.

use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug)]
struct Slot<V> {
    refs: AtomicU32,
    value: V,
}

/// A counted reference to an interned value
///
/// Handles are not `Clone`; take additional references through the store so
/// every increment is paired with an explicit [`RefCountedStore::release`].
#[derive(Debug)]
pub struct Handle<K, V> {
    key: K,
    slot: Arc<Slot<V>>,
}

impl<K, V> Handle<K, V> {
    /// The interning key this handle was resolved under
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Current reference count (racy; diagnostics and tests only)
    pub fn ref_count(&self) -> u32 {
        self.slot.refs.load(Ordering::SeqCst)
    }
}

impl<K, V> std::ops::Deref for Handle<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.slot.value
    }
}

/// Race-safe get-or-create interning table
pub struct RefCountedStore<K, V> {
    slots: DashMap<K, Arc<Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V> RefCountedStore<K, V> {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Resolve `key` to its interned value, building it on first use
    ///
    /// Identical keys always resolve to the same object while any reference
    /// is outstanding. Runs under the shard lock for the key, so an entry
    /// found at count zero (a release in flight) is safely resurrected; the
    /// releasing thread will observe the new count and abandon removal.
    pub fn get_or_create(&self, key: K, build: impl FnOnce() -> V) -> Handle<K, V> {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let slot = Arc::clone(entry.get());
                slot.refs.fetch_add(1, Ordering::SeqCst);
                Handle { key, slot }
            }
            Entry::Vacant(entry) => {
                let slot = Arc::new(Slot {
                    refs: AtomicU32::new(1),
                    value: build(),
                });
                entry.insert(Arc::clone(&slot));
                Handle { key, slot }
            }
        }
    }

    /// Resolve `key` without creating, taking a reference on hit
    pub fn get(&self, key: &K) -> Option<Handle<K, V>> {
        let slot = self.slots.get(key).map(|r| Arc::clone(r.value()))?;
        slot.refs.fetch_add(1, Ordering::SeqCst);
        Some(Handle {
            key: key.clone(),
            slot,
        })
    }

    /// Take a keyed reference without materializing a handle
    ///
    /// Pairs with [`release_key`]. Returns false (and takes nothing) when the
    /// key is absent.
    ///
    /// [`release_key`]: RefCountedStore::release_key
    pub fn retain(&self, key: &K) -> bool {
        match self.slots.get(key) {
            Some(slot) => {
                slot.refs.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Drop one reference
    ///
    /// When the count reaches zero the entry is removed, but only if the
    /// indexed slot is still this handle's object and still unreferenced at
    /// the moment the shard lock is held. A concurrent `get_or_create` that
    /// won the race leaves the entry in place; a key already removed by
    /// another releasing thread is a no-op. Returns true when this call
    /// removed the entry.
    pub fn release(&self, handle: Handle<K, V>) -> bool {
        let Handle { key, slot } = handle;
        if slot.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
            return false;
        }
        self.slots
            .remove_if(&key, |_, live| {
                Arc::ptr_eq(live, &slot) && live.refs.load(Ordering::SeqCst) == 0
            })
            .is_some()
    }

    /// Drop one reference by key, for owners that track refs without a handle
    ///
    /// Same zero-check-under-shard-lock contract as [`release`]; an absent
    /// key is a no-op. Returns true when this call removed the entry.
    ///
    /// [`release`]: RefCountedStore::release
    pub fn release_key(&self, key: &K) -> bool {
        let Some(slot) = self.slots.get(key).map(|r| Arc::clone(r.value())) else {
            return false;
        };
        if slot.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
            return false;
        }
        self.slots
            .remove_if(key, |_, live| {
                Arc::ptr_eq(live, &slot) && live.refs.load(Ordering::SeqCst) == 0
            })
            .is_some()
    }

    /// Visit every live entry
    ///
    /// Takes no references; callers must not stash the borrowed value.
    pub fn scan(&self, mut f: impl FnMut(&K, &V)) {
        for entry in self.slots.iter() {
            f(entry.key(), &entry.value().value);
        }
    }

    /// Whether `key` currently resolves to a live entry
    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V> Default for RefCountedStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_returns_same_object() {
        let store: RefCountedStore<&str, u32> = RefCountedStore::new();

        let a = store.get_or_create("k", || 41);
        let b = store.get_or_create("k", || 99);

        assert_eq!(*a, 41);
        assert_eq!(*b, 41);
        assert_eq!(a.ref_count(), 2);

        assert!(!store.release(a));
        assert!(store.release(b));
        assert!(store.is_empty());
    }

    #[test]
    fn test_release_last_ref_removes() {
        let store: RefCountedStore<u64, String> = RefCountedStore::new();
        let h = store.get_or_create(5, || "five".to_string());
        assert!(store.contains(&5));

        assert!(store.release(h));
        assert!(!store.contains(&5));
    }

    #[test]
    fn test_get_does_not_create() {
        let store: RefCountedStore<u64, u64> = RefCountedStore::new();
        assert!(store.get(&1).is_none());

        let h = store.get_or_create(1, || 10);
        let g = store.get(&1).unwrap();
        assert_eq!(*g, 10);

        store.release(h);
        store.release(g);
        assert!(store.is_empty());
    }

    #[test]
    fn test_release_key_pairs_with_keyed_ref() {
        let store: RefCountedStore<u64, u64> = RefCountedStore::new();
        let h = store.get_or_create(9, || 0);
        let _second = store.get_or_create(9, || 0);

        assert!(!store.release_key(&9));
        assert!(store.contains(&9));
        assert!(store.release(h));
        assert!(!store.contains(&9));

        // absent key is a silent no-op
        assert!(!store.release_key(&9));
    }

    #[test]
    fn test_recreate_after_removal() {
        let store: RefCountedStore<&str, u32> = RefCountedStore::new();
        let h = store.get_or_create("x", || 1);
        store.release(h);

        let h2 = store.get_or_create("x", || 2);
        assert_eq!(*h2, 2);
        store.release(h2);
    }
}
