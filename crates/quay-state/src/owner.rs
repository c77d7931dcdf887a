//! Open-owner and lock-owner interning
//!
//! Owners are the client-chosen opaque strings on whose behalf open and lock
//! state is held. Identical bytes from the same client always resolve to the
//! same interned [`Owner`]; a lock-owner keeps a reference on the open-owner
//! it derives from for as long as it lives.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;

use crate::client::ClientId;
use crate::store::{Handle, RefCountedStore};

/// Which protocol role an owner plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// OPEN-time owner
    Open,
    /// LOCK-time owner, derived from an open-owner
    Lock,
}

/// Interning key: (client, opaque owner bytes, role)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    /// Owning client
    pub client: ClientId,
    /// Client-chosen opaque owner string
    pub owner: Bytes,
    /// Open or lock role
    pub kind: OwnerKind,
}

impl OwnerKey {
    /// Key for an open-owner
    pub fn open(client: ClientId, owner: Bytes) -> Self {
        Self {
            client,
            owner,
            kind: OwnerKind::Open,
        }
    }

    /// Key for a lock-owner
    pub fn lock(client: ClientId, owner: Bytes) -> Self {
        Self {
            client,
            owner,
            kind: OwnerKind::Lock,
        }
    }

    /// Whether two keys name the same protocol entity
    pub fn same_entity(&self, other: &OwnerKey) -> bool {
        self.client == other.client && self.kind == other.kind && self.owner == other.owner
    }

    /// Raw clientid value, for conflict reports
    pub fn client_value(&self) -> u64 {
        self.client.value()
    }
}

/// Interned owner state
///
/// The reference count lives in the store; each state object holds one
/// reference on its owner, so an owner disappears when its last state does.
pub struct Owner {
    seqid: AtomicU32,
    confirmed: AtomicBool,
    parent: Option<OwnerKey>,
}

impl Owner {
    fn new(parent: Option<OwnerKey>) -> Self {
        Self {
            seqid: AtomicU32::new(0),
            confirmed: AtomicBool::new(false),
            parent,
        }
    }

    /// Last owner seqid accepted from this owner
    pub fn seqid(&self) -> u32 {
        self.seqid.load(Ordering::SeqCst)
    }

    /// Record the owner seqid of an accepted request
    pub fn set_seqid(&self, seqid: u32) {
        self.seqid.store(seqid, Ordering::SeqCst);
    }

    /// Whether a seqid-gated request has succeeded for this owner yet
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    /// Mark the owner confirmed (first successful seqid-gated operation)
    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
    }

    /// The open-owner a lock-owner derives from
    pub fn parent(&self) -> Option<&OwnerKey> {
        self.parent.as_ref()
    }
}

/// Counted reference to an interned owner
pub type OwnerHandle = Handle<OwnerKey, Owner>;

/// Registry of interned owners
pub struct OwnerStore {
    owners: RefCountedStore<OwnerKey, Owner>,
}

impl OwnerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            owners: RefCountedStore::new(),
        }
    }

    /// Intern an open-owner
    pub fn get_or_create_open(&self, client: ClientId, owner: Bytes) -> OwnerHandle {
        self.owners
            .get_or_create(OwnerKey::open(client, owner), || Owner::new(None))
    }

    /// Intern a lock-owner derived from `open_owner`
    ///
    /// The first creation takes a reference on the open-owner; it is dropped
    /// again when the lock-owner is destroyed.
    pub fn get_or_create_lock(
        &self,
        client: ClientId,
        owner: Bytes,
        open_owner: &OwnerKey,
    ) -> OwnerHandle {
        let key = OwnerKey::lock(client, owner);
        let mut created = false;
        let handle = self.owners.get_or_create(key, || {
            created = true;
            Owner::new(Some(open_owner.clone()))
        });
        if created {
            self.owners.retain(open_owner);
        }
        handle
    }

    /// Look up an owner without creating
    pub fn get(&self, key: &OwnerKey) -> Option<OwnerHandle> {
        self.owners.get(key)
    }

    /// Take a keyed reference (a state object now points at this owner)
    pub fn retain(&self, key: &OwnerKey) -> bool {
        self.owners.retain(key)
    }

    /// Drop a handle reference, cascading to a lock-owner's parent
    pub fn release(&self, handle: OwnerHandle) {
        let parent = handle.parent().cloned();
        if self.owners.release(handle) {
            if let Some(parent) = parent {
                self.owners.release_key(&parent);
            }
        }
    }

    /// Drop a keyed reference, cascading to a lock-owner's parent
    pub fn release_key(&self, key: &OwnerKey) {
        let parent = self
            .owners
            .get(key)
            .map(|h| {
                let p = h.parent().cloned();
                self.owners.release(h);
                p
            })
            .unwrap_or(None);
        if self.owners.release_key(key) {
            if let Some(parent) = parent {
                self.owners.release_key(&parent);
            }
        }
    }

    /// Whether any owner is interned for `client`
    pub fn client_has_owners(&self, client: ClientId) -> bool {
        let mut found = false;
        self.owners.scan(|key, _| {
            if key.client == client {
                found = true;
            }
        });
        found
    }

    /// Number of interned owners
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl Default for OwnerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientId {
        ClientId::new(0x11)
    }

    #[test]
    fn test_open_owner_interning() {
        let store = OwnerStore::new();
        let a = store.get_or_create_open(client(), Bytes::from_static(b"owner-1"));
        let b = store.get_or_create_open(client(), Bytes::from_static(b"owner-1"));

        assert_eq!(a.ref_count(), 2);
        store.release(a);
        store.release(b);
        assert!(store.is_empty());
    }

    #[test]
    fn test_lock_owner_holds_its_open_owner() {
        let store = OwnerStore::new();
        let open = store.get_or_create_open(client(), Bytes::from_static(b"oo"));
        let open_key = open.key().clone();

        let lock = store.get_or_create_lock(client(), Bytes::from_static(b"lo"), &open_key);
        assert_eq!(store.len(), 2);

        // dropping the caller's open ref keeps the open-owner alive through
        // the lock-owner's derivation reference
        store.release(open);
        assert!(store.get(&open_key).is_some_and(|h| {
            store.release(h);
            true
        }));

        store.release(lock);
        assert!(store.is_empty());
    }

    #[test]
    fn test_open_and_lock_roles_do_not_collide() {
        let store = OwnerStore::new();
        let open = store.get_or_create_open(client(), Bytes::from_static(b"same"));
        let open_key = open.key().clone();
        let lock = store.get_or_create_lock(client(), Bytes::from_static(b"same"), &open_key);

        assert_eq!(store.len(), 2);
        assert!(!open.key().same_entity(lock.key()));

        store.release(lock);
        store.release(open);
        assert!(store.is_empty());
    }

    #[test]
    fn test_owner_seqid_and_confirmation() {
        let store = OwnerStore::new();
        let h = store.get_or_create_open(client(), Bytes::from_static(b"x"));

        assert!(!h.is_confirmed());
        h.set_seqid(7);
        h.confirm();
        assert_eq!(h.seqid(), 7);
        assert!(h.is_confirmed());

        store.release(h);
    }
}
