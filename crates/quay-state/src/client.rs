//! Client registration, confirmation, and expiry
//!
//! One [`ClientRecord`] exists per distinct principal (opaque co-owner bytes
//! plus network address). The record's mutex totally orders confirm and
//! expire transitions for that principal; at any instant it holds at most one
//! confirmed and one unconfirmed [`ClientIdRecord`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::owner::OwnerStore;
use crate::recovery::RecoveryLedger;
use crate::state_table::StateStore;
use crate::store::RefCountedStore;

/// Server-issued 64-bit client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Create from a raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Client-supplied 8-byte boot verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verifier(pub [u8; 8]);

/// What identifies a client principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Client-chosen opaque owner identifier
    pub owner: Bytes,
    /// Network address the registration arrived from
    pub addr: SocketAddr,
}

impl Principal {
    /// Recovery tag: stable across restarts for the same principal
    pub fn recovery_tag(&self) -> String {
        let mut tag = String::with_capacity(self.owner.len() * 2 + 24);
        for b in self.owner.iter() {
            tag.push_str(&format!("{b:02x}"));
        }
        tag.push('@');
        tag.push_str(&self.addr.ip().to_string());
        tag
    }
}

/// Callback channel details supplied at registration
#[derive(Debug, Clone, Default)]
pub struct CallbackInfo {
    /// Callback RPC program number
    pub program: u32,
    /// Universal address of the callback service
    pub location: String,
}

/// Confirmation state of a client id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    /// Registered, awaiting confirmation
    Unconfirmed,
    /// Confirmed and usable
    Confirmed,
    /// Expired; terminal
    Expired,
}

/// One issued client id and its lifecycle state
#[derive(Debug)]
pub struct ClientIdRecord {
    /// The issued id
    pub id: ClientId,
    /// Verifier presented at registration
    pub verifier: Verifier,
    /// Registering principal
    pub principal: Principal,
    /// Callback channel info
    pub callback: Mutex<CallbackInfo>,
    /// Recovery tag for the ledger
    pub recovery_tag: String,
    state: Mutex<ConfirmState>,
    lease: Mutex<Instant>,
    /// CREATE_SESSION replay sequence, seeded to 1 at registration
    pub create_session_seq: AtomicU32,
    allow_reclaim: AtomicBool,
    reclaim_completed: AtomicBool,
}

impl ClientIdRecord {
    fn new(
        id: ClientId,
        verifier: Verifier,
        principal: Principal,
        callback: CallbackInfo,
    ) -> Arc<Self> {
        let recovery_tag = principal.recovery_tag();
        Arc::new(Self {
            id,
            verifier,
            principal,
            callback: Mutex::new(callback),
            recovery_tag,
            state: Mutex::new(ConfirmState::Unconfirmed),
            lease: Mutex::new(Instant::now()),
            create_session_seq: AtomicU32::new(1),
            allow_reclaim: AtomicBool::new(false),
            reclaim_completed: AtomicBool::new(false),
        })
    }

    /// Current confirmation state
    pub fn confirm_state(&self) -> ConfirmState {
        *self.state.lock()
    }

    /// Refresh the lease timestamp
    pub fn renew_lease(&self) {
        *self.lease.lock() = Instant::now();
    }

    /// Whether the lease has been idle longer than `lease_time`
    pub fn lease_expired(&self, lease_time: Duration) -> bool {
        self.lease.lock().elapsed() > lease_time
    }

    /// Whether this client may reclaim during grace
    pub fn may_reclaim(&self) -> bool {
        self.allow_reclaim.load(Ordering::SeqCst)
    }

    /// Grant reclaim eligibility (set when the grace manager recognizes the
    /// client's recovery tag from the previous incarnation)
    pub fn set_may_reclaim(&self, allowed: bool) {
        self.allow_reclaim.store(allowed, Ordering::SeqCst);
    }

    /// Record RECLAIM_COMPLETE; false if it was already recorded
    pub fn mark_reclaim_complete(&self) -> bool {
        !self.reclaim_completed.swap(true, Ordering::SeqCst)
    }
}

struct Slots {
    confirmed: Option<Arc<ClientIdRecord>>,
    unconfirmed: Option<Arc<ClientIdRecord>>,
}

/// Per-principal record holding the confirmed/unconfirmed pair
pub struct ClientRecord {
    slots: Mutex<Slots>,
}

/// Which slot a lookup wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// The confirmed record
    Confirmed,
    /// The unconfirmed record
    Unconfirmed,
}

/// Registry of client principals and their issued ids
pub struct ClientRegistry {
    records: RefCountedStore<Bytes, ClientRecord>,
    by_id: DashMap<ClientId, Arc<ClientIdRecord>>,
    counter: AtomicU64,
    epoch: u32,
    lease_time: Duration,
}

impl ClientRegistry {
    /// Create a registry; `epoch` salts issued ids so a restarted server
    /// never reissues a previous incarnation's clientid
    pub fn new(epoch: u32, lease_time: Duration) -> Self {
        Self {
            records: RefCountedStore::new(),
            by_id: DashMap::new(),
            counter: AtomicU64::new(1),
            epoch,
            lease_time,
        }
    }

    fn next_clientid(&self) -> ClientId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        ClientId::new(((self.epoch as u64) << 32) | (n & 0xFFFF_FFFF))
    }

    /// Register a principal, issuing a fresh unconfirmed client id
    ///
    /// An existing confirmed id for the principal is left in place; the new
    /// unconfirmed record sits alongside it until confirmation. A previous
    /// unconfirmed record is displaced.
    pub fn register(
        &self,
        principal: Principal,
        verifier: Verifier,
        callback: CallbackInfo,
    ) -> Arc<ClientIdRecord> {
        let key = principal.owner.clone();
        // this handle's reference becomes the new id's reference on the
        // shared record; it is dropped again in expire_record
        let shared = self.records.get_or_create(key.clone(), || ClientRecord {
            slots: Mutex::new(Slots {
                confirmed: None,
                unconfirmed: None,
            }),
        });

        let id = self.next_clientid();
        let record = ClientIdRecord::new(id, verifier, principal, callback);

        {
            let mut guard = shared.slots.lock();
            if let Some(old) = guard.unconfirmed.take() {
                *old.state.lock() = ConfirmState::Expired;
                self.by_id.remove(&old.id);
                // the displaced id's reference on the shared record
                self.records.release_key(&key);
            }
            guard.unconfirmed = Some(Arc::clone(&record));
        }

        self.by_id.insert(id, Arc::clone(&record));
        debug!(clientid = id.value(), "registered unconfirmed client");
        record
    }

    /// Confirm an issued client id
    ///
    /// Idempotent when the confirmed slot already holds this id with the same
    /// verifier. An older confirmed id under the same principal is expired
    /// (its state released) before the new one is installed; its id is
    /// returned so the caller can tear down anything the state layer does
    /// not own, such as sessions.
    pub fn confirm(
        &self,
        clientid: ClientId,
        verifier: Verifier,
        caller: &Principal,
        states: &StateStore,
        owners: &OwnerStore,
        ledger: &dyn RecoveryLedger,
    ) -> StateResult<(Arc<ClientIdRecord>, Option<ClientId>)> {
        let candidate = self
            .by_id
            .get(&clientid)
            .map(|r| Arc::clone(&r))
            .ok_or(StateError::StaleClientId)?;

        if candidate.principal.owner != caller.owner {
            return Err(StateError::StaleClientId);
        }
        if candidate.principal.addr != caller.addr {
            warn!(clientid = clientid.value(), "confirm from mismatched address");
            return Err(StateError::ClidInUse);
        }

        enum Step {
            Replay(Arc<ClientIdRecord>),
            Stale,
            Installed(Option<Arc<ClientIdRecord>>),
        }

        let key = candidate.principal.owner.clone();
        let record = self.records.get(&key).ok_or(StateError::StaleClientId)?;
        let step = {
            let mut slots = record.slots.lock();

            // duplicate CONFIRM replay: already installed with this verifier
            let replay = slots
                .confirmed
                .as_ref()
                .filter(|c| c.id == clientid && c.verifier == verifier)
                .map(Arc::clone);

            if let Some(confirmed) = replay {
                Step::Replay(confirmed)
            } else {
                match slots.unconfirmed.take() {
                    Some(fresh) if fresh.id == clientid && fresh.verifier == verifier => {
                        let displaced = slots.confirmed.take();
                        *fresh.state.lock() = ConfirmState::Confirmed;
                        fresh.renew_lease();
                        slots.confirmed = Some(fresh);
                        Step::Installed(displaced)
                    }
                    other => {
                        slots.unconfirmed = other;
                        Step::Stale
                    }
                }
            }
        };
        self.records.release(record);

        let displaced = match step {
            Step::Replay(confirmed) => return Ok((confirmed, None)),
            Step::Stale => return Err(StateError::StaleClientId),
            Step::Installed(displaced) => displaced,
        };

        let displaced_id = displaced.as_ref().map(|old| old.id);
        if let Some(old) = displaced {
            info!(
                old = old.id.value(),
                new = clientid.value(),
                "expiring displaced confirmed client"
            );
            self.expire_record(&old, false, states, owners, ledger)?;
        }

        if let Err(err) = ledger.persist_add(&candidate.recovery_tag) {
            warn!(%err, "could not persist recovery record");
        }
        info!(clientid = clientid.value(), "confirmed client");
        Ok((candidate, displaced_id))
    }

    /// The confirmed id currently registered for `principal`, if any
    ///
    /// Used by EXCHANGE_ID to answer a re-registration with the same
    /// verifier idempotently instead of minting a new id.
    pub fn find_confirmed(&self, principal: &Principal) -> Option<Arc<ClientIdRecord>> {
        let record = self.records.get(&principal.owner)?;
        let confirmed = record.slots.lock().confirmed.clone();
        self.records.release(record);
        confirmed.filter(|c| c.principal.addr == principal.addr)
    }

    /// Look up an issued id in the wanted confirmation state
    pub fn lookup(&self, clientid: ClientId, want: Want) -> StateResult<Arc<ClientIdRecord>> {
        let record = self
            .by_id
            .get(&clientid)
            .map(|r| Arc::clone(&r))
            .ok_or(StateError::StaleClientId)?;
        let ok = match (want, record.confirm_state()) {
            (Want::Confirmed, ConfirmState::Confirmed) => true,
            (Want::Unconfirmed, ConfirmState::Unconfirmed) => true,
            _ => false,
        };
        if ok {
            Ok(record)
        } else {
            Err(StateError::StaleClientId)
        }
    }

    /// Renew a confirmed client's lease
    pub fn renew(&self, clientid: ClientId) -> StateResult<()> {
        let record = self.lookup(clientid, Want::Confirmed)?;
        if record.lease_expired(self.lease_time) {
            return Err(StateError::Expired);
        }
        record.renew_lease();
        Ok(())
    }

    /// Expire a client id, releasing everything it owns
    ///
    /// With `preserve_for_reclaim` the client's recovery record (including
    /// revoked delegation filehandles) is pushed to the ledger before its
    /// state is torn down; otherwise the record is removed.
    pub fn expire(
        &self,
        clientid: ClientId,
        preserve_for_reclaim: bool,
        states: &StateStore,
        owners: &OwnerStore,
        ledger: &dyn RecoveryLedger,
    ) -> StateResult<()> {
        let record = self
            .by_id
            .get(&clientid)
            .map(|r| Arc::clone(&r))
            .ok_or(StateError::StaleClientId)?;
        self.expire_record(&record, preserve_for_reclaim, states, owners, ledger)
    }

    fn expire_record(
        &self,
        record: &Arc<ClientIdRecord>,
        preserve_for_reclaim: bool,
        states: &StateStore,
        owners: &OwnerStore,
        ledger: &dyn RecoveryLedger,
    ) -> StateResult<()> {
        {
            let mut state = record.state.lock();
            if *state == ConfirmState::Expired {
                return Ok(());
            }
            *state = ConfirmState::Expired;
        }

        let revoked = states.expire_client(record.id, owners);
        if preserve_for_reclaim {
            ledger.persist_add(&record.recovery_tag)?;
            for handle in &revoked {
                ledger.persist_revoke(&record.recovery_tag, handle)?;
            }
        } else {
            ledger.persist_remove(&record.recovery_tag)?;
        }

        let key = record.principal.owner.clone();
        if let Some(shared) = self.records.get(&key) {
            {
                let mut slots = shared.slots.lock();
                if slots
                    .confirmed
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(c, record))
                {
                    slots.confirmed = None;
                }
                if slots
                    .unconfirmed
                    .as_ref()
                    .is_some_and(|u| Arc::ptr_eq(u, record))
                {
                    slots.unconfirmed = None;
                }
            }
            self.records.release(shared);
        }
        self.by_id.remove(&record.id);
        // the expired id's reference on the shared record
        self.records.release_key(&key);

        info!(
            clientid = record.id.value(),
            preserved = preserve_for_reclaim,
            "expired client"
        );
        Ok(())
    }

    /// Confirmed clients whose leases have lapsed
    pub fn expired_clients(&self) -> Vec<ClientId> {
        self.by_id
            .iter()
            .filter(|entry| {
                entry.value().confirm_state() == ConfirmState::Confirmed
                    && entry.value().lease_expired(self.lease_time)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of issued (non-expired) ids
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no ids are issued
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Configured lease time
    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::MemoryLedger;

    fn principal(owner: &'static [u8], port: u16) -> Principal {
        Principal {
            owner: Bytes::from_static(owner),
            addr: format!("10.0.0.1:{port}").parse().unwrap(),
        }
    }

    fn registry() -> (ClientRegistry, StateStore, OwnerStore, MemoryLedger) {
        (
            ClientRegistry::new(3, Duration::from_secs(90)),
            StateStore::new(3),
            OwnerStore::new(),
            MemoryLedger::new(),
        )
    }

    #[test]
    fn test_register_then_confirm() {
        let (reg, states, owners, ledger) = registry();
        let p = principal(b"client-a", 700);
        let rec = reg.register(p.clone(), Verifier([1; 8]), CallbackInfo::default());
        assert_eq!(rec.confirm_state(), ConfirmState::Unconfirmed);

        let (confirmed, displaced) = reg
            .confirm(rec.id, Verifier([1; 8]), &p, &states, &owners, &ledger)
            .unwrap();
        assert_eq!(confirmed.confirm_state(), ConfirmState::Confirmed);
        assert!(displaced.is_none());
        assert_eq!(confirmed.id, rec.id);
    }

    #[test]
    fn test_confirm_is_idempotent() {
        let (reg, states, owners, ledger) = registry();
        let p = principal(b"client-a", 700);
        let rec = reg.register(p.clone(), Verifier([1; 8]), CallbackInfo::default());

        let (first, _) = reg
            .confirm(rec.id, Verifier([1; 8]), &p, &states, &owners, &ledger)
            .unwrap();
        let (second, _) = reg
            .confirm(rec.id, Verifier([1; 8]), &p, &states, &owners, &ledger)
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_confirm_from_wrong_address_is_clid_in_use() {
        let (reg, states, owners, ledger) = registry();
        let p = principal(b"client-a", 700);
        let rec = reg.register(p.clone(), Verifier([1; 8]), CallbackInfo::default());

        let intruder = principal(b"client-a", 999);
        let err = reg
            .confirm(rec.id, Verifier([1; 8]), &intruder, &states, &owners, &ledger)
            .unwrap_err();
        assert_eq!(err, StateError::ClidInUse);
    }

    #[test]
    fn test_reboot_displaces_old_confirmed() {
        let (reg, states, owners, ledger) = registry();
        let p = principal(b"client-a", 700);

        let first = reg.register(p.clone(), Verifier([1; 8]), CallbackInfo::default());
        reg.confirm(first.id, Verifier([1; 8]), &p, &states, &owners, &ledger)
            .unwrap();

        // client reboots: new verifier, new registration alongside the old
        let second = reg.register(p.clone(), Verifier([2; 8]), CallbackInfo::default());
        assert_ne!(first.id, second.id);
        assert_eq!(first.confirm_state(), ConfirmState::Confirmed);

        let (_, displaced) = reg
            .confirm(second.id, Verifier([2; 8]), &p, &states, &owners, &ledger)
            .unwrap();
        assert_eq!(displaced, Some(first.id));
        assert_eq!(first.confirm_state(), ConfirmState::Expired);
        assert_eq!(second.confirm_state(), ConfirmState::Confirmed);
        assert!(reg.lookup(first.id, Want::Confirmed).is_err());
    }

    #[test]
    fn test_unknown_clientid_is_stale() {
        let (reg, states, owners, ledger) = registry();
        let p = principal(b"client-a", 700);
        let err = reg
            .confirm(ClientId::new(0xdead), Verifier([0; 8]), &p, &states, &owners, &ledger)
            .unwrap_err();
        assert_eq!(err, StateError::StaleClientId);
    }

    #[test]
    fn test_expire_preserves_recovery_record() {
        let (reg, states, owners, ledger) = registry();
        let p = principal(b"client-a", 700);
        let rec = reg.register(p.clone(), Verifier([1; 8]), CallbackInfo::default());
        reg.confirm(rec.id, Verifier([1; 8]), &p, &states, &owners, &ledger)
            .unwrap();

        reg.expire(rec.id, true, &states, &owners, &ledger).unwrap();

        let loaded = ledger.read_clients().unwrap();
        assert!(loaded.iter().any(|r| r.tag == rec.recovery_tag));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_expire_without_preserve_removes_record() {
        let (reg, states, owners, ledger) = registry();
        let p = principal(b"client-a", 700);
        let rec = reg.register(p.clone(), Verifier([1; 8]), CallbackInfo::default());
        reg.confirm(rec.id, Verifier([1; 8]), &p, &states, &owners, &ledger)
            .unwrap();

        reg.expire(rec.id, false, &states, &owners, &ledger).unwrap();
        let loaded = ledger.read_clients().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_reclaim_complete_marks_once() {
        let (reg, _, _, _) = registry();
        let rec = reg.register(principal(b"c", 1), Verifier([0; 8]), CallbackInfo::default());
        assert!(rec.mark_reclaim_complete());
        assert!(!rec.mark_reclaim_complete());
    }
}
