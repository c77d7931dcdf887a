//! Shuttle-based concurrency tests for the refcounted interning store
//!
//! These tests use shuttle to randomly explore interleavings of concurrent
//! release and get-or-create calls against the store's removal protocol:
//! decrement, then re-check identity and zero under the bucket lock before
//! removing. The property under test is that no interleaving ever hands a
//! caller an entry whose destruction has begun, and that a resurrected
//! entry survives the release that raced with it.

use shuttle::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use shuttle::sync::Mutex;
use shuttle::thread;
use std::collections::HashMap;
use std::sync::Arc;

struct Slot {
    refs: AtomicU32,
    alive: AtomicBool,
}

/// Simplified single-key model of the store's release/get protocol
struct ShuttleStore {
    map: Mutex<HashMap<u32, Arc<Slot>>>,
}

impl ShuttleStore {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self) -> Arc<Slot> {
        let mut map = self.map.lock().unwrap();
        if let Some(slot) = map.get(&0) {
            slot.refs.fetch_add(1, Ordering::SeqCst);
            // an indexed entry must never be mid-destruction
            assert!(
                slot.alive.load(Ordering::SeqCst),
                "get_or_create observed a destroyed slot"
            );
            return Arc::clone(slot);
        }
        let slot = Arc::new(Slot {
            refs: AtomicU32::new(1),
            alive: AtomicBool::new(true),
        });
        map.insert(0, Arc::clone(&slot));
        slot
    }

    fn release(&self, slot: Arc<Slot>) {
        if slot.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let mut map = self.map.lock().unwrap();
        let remove = map
            .get(&0)
            .is_some_and(|live| Arc::ptr_eq(live, &slot) && live.refs.load(Ordering::SeqCst) == 0);
        if remove {
            map.remove(&0);
            // destruction may only begin after the entry is unindexed
            slot.alive.store(false, Ordering::SeqCst);
        }
    }
}

#[test]
fn shuttle_release_vs_get_never_observes_destruction() {
    shuttle::check_random(
        || {
            let store = Arc::new(ShuttleStore::new());
            let seed = store.get_or_create();

            let mut handles = Vec::new();
            for _ in 0..2 {
                let store = Arc::clone(&store);
                handles.push(thread::spawn(move || {
                    let slot = store.get_or_create();
                    store.release(slot);
                }));
            }

            let releaser = {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.release(seed);
                })
            };

            for handle in handles {
                handle.join().unwrap();
            }
            releaser.join().unwrap();
        },
        1000,
    );
}

#[test]
fn shuttle_resurrected_entry_survives_racing_release() {
    shuttle::check_random(
        || {
            let store = Arc::new(ShuttleStore::new());
            let seed = store.get_or_create();

            let holder = {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    // may resurrect the slot the releaser just zeroed
                    let slot = store.get_or_create();
                    assert!(slot.alive.load(Ordering::SeqCst));
                    slot
                })
            };

            store.release(seed);
            let kept = holder.join().unwrap();

            // while a reference is live the entry must still be indexed
            {
                let map = store.map.lock().unwrap();
                let live = map.get(&0).expect("held entry vanished from index");
                assert!(Arc::ptr_eq(live, &kept));
            }

            store.release(kept);
            assert!(store.map.lock().unwrap().is_empty());
        },
        1000,
    );
}

#[test]
fn shuttle_concurrent_churn_leaves_clean_index() {
    shuttle::check_random(
        || {
            let store = Arc::new(ShuttleStore::new());

            let mut handles = Vec::new();
            for _ in 0..3 {
                let store = Arc::clone(&store);
                handles.push(thread::spawn(move || {
                    for _ in 0..2 {
                        let slot = store.get_or_create();
                        store.release(slot);
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }

            // every reference released: the index must be empty
            assert!(store.map.lock().unwrap().is_empty());
        },
        500,
    );
}
