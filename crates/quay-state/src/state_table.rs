//! Per-file state objects and the seqid-gated open/lock state machine
//!
//! Every piece of open, lock, delegation, or layout state is a
//! [`StateObject`] named by a stateid whose 12-byte "other" field is unique
//! for the server's lifetime. File entries own their state objects; owners
//! are referenced through the interning store so an owner outlives its last
//! state by exactly nothing.
//!
//! All mutation of a file's state happens under that file's list lock, which
//! is also held across conflict scans — callers see a linearizable snapshot
//! of the locks that defeated them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::client::ClientId;
use crate::conflict::{self, LockRange, LockType};
use crate::error::{StateError, StateResult};
use crate::filehandle::FileId;
use crate::owner::{OwnerKey, OwnerStore};

/// Stateid: 4-byte generation plus 12-byte opaque name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    /// Generation of the named state
    pub seqid: u32,
    /// Opaque name, unique for the server lifetime
    pub other: [u8; 12],
}

impl StateId {
    /// Anonymous stateid (all zeros)
    pub const ANONYMOUS: Self = Self {
        seqid: 0,
        other: [0; 12],
    };

    /// Read-bypass stateid (all ones)
    pub const READ_BYPASS: Self = Self {
        seqid: u32::MAX,
        other: [0xFF; 12],
    };

    /// Create a stateid
    pub fn new(seqid: u32, other: [u8; 12]) -> Self {
        Self { seqid, other }
    }

    /// Whether this is the all-zeros anonymous stateid
    pub fn is_anonymous(&self) -> bool {
        self.seqid == 0 && self.other == [0; 12]
    }

    /// Whether this is the all-ones bypass stateid
    pub fn is_read_bypass(&self) -> bool {
        self.seqid == u32::MAX && self.other == [0xFF; 12]
    }

    /// Whether this is one of the special stateids that bypass lookup
    pub fn is_special(&self) -> bool {
        self.is_anonymous() || self.is_read_bypass()
    }
}

/// Share access bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareAccess(u32);

impl ShareAccess {
    /// Read access
    pub const READ: Self = Self(0x1);
    /// Write access
    pub const WRITE: Self = Self(0x2);
    /// Read and write
    pub const BOTH: Self = Self(0x3);

    /// Whether all of `other`'s bits are present
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Raw bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// From raw bits
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether `other` is a subset of these bits
    pub fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }
}

/// Share deny bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareDeny(u32);

impl ShareDeny {
    /// Deny nothing
    pub const NONE: Self = Self(0x0);
    /// Deny read
    pub const READ: Self = Self(0x1);
    /// Deny write
    pub const WRITE: Self = Self(0x2);
    /// Deny both
    pub const BOTH: Self = Self(0x3);

    /// Whether all of `other`'s bits are present
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Raw bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// From raw bits
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether `other` is a subset of these bits
    pub fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }
}

/// Share-reservation payload of an open state
#[derive(Debug, Clone)]
pub struct ShareState {
    /// Granted access bits
    pub access: ShareAccess,
    /// Granted deny bits
    pub deny: ShareDeny,
    /// Number of lock states opened under this share
    pub lock_count: u32,
}

/// One granted byte range
#[derive(Debug, Clone, Copy)]
pub struct HeldLock {
    /// The granted range
    pub range: LockRange,
    /// Read or write
    pub lock_type: LockType,
}

/// Byte-range payload of a lock state
///
/// One lock state per (lock-owner, file); it accumulates ranges as the owner
/// locks and sheds them as it unlocks.
#[derive(Debug, Clone)]
pub struct LockList {
    /// The open state this lock state derives from
    pub open_other: [u8; 12],
    /// Held ranges in grant order
    pub ranges: Vec<HeldLock>,
}

/// Delegation kind (pass-through; recall machinery lives elsewhere)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationKind {
    /// Read delegation
    Read,
    /// Write delegation
    Write,
}

/// Delegation payload
///
/// Keeps the filehandle the delegation was granted under so an expiry can
/// record it in the revoked set of the client's recovery record.
#[derive(Debug, Clone)]
pub struct DelegationState {
    /// Read or write
    pub kind: DelegationKind,
    /// Filehandle the delegation was granted on
    pub handle: Bytes,
}

/// State payload variants
#[derive(Debug, Clone)]
pub enum StateVariant {
    /// OPEN share reservation
    Share(ShareState),
    /// Byte-range locks
    Lock(LockList),
    /// Delegation (pass-through)
    Delegation(DelegationState),
    /// pNFS layout (pass-through)
    Layout,
}

/// A single piece of stateid-named state
#[derive(Debug, Clone)]
pub struct StateObject {
    seqid: u32,
    other: [u8; 12],
    file: FileId,
    owner: OwnerKey,
    /// Variant payload
    pub variant: StateVariant,
}

impl StateObject {
    /// Current stateid (generation + name)
    pub fn stateid(&self) -> StateId {
        StateId::new(self.seqid, self.other)
    }

    /// Current generation
    pub fn seqid(&self) -> u32 {
        self.seqid
    }

    /// Opaque name
    pub fn other(&self) -> [u8; 12] {
        self.other
    }

    /// File this state lives on
    pub fn file(&self) -> FileId {
        self.file
    }

    /// Owner of this state
    pub fn owner(&self) -> &OwnerKey {
        &self.owner
    }

    fn bump_seqid(&mut self) {
        self.seqid = self.seqid.wrapping_add(1);
        if self.seqid == 0 {
            self.seqid = 1;
        }
    }
}

/// How a LOCK request names its owner
#[derive(Debug, Clone)]
pub enum Locker {
    /// First lock by a new lock-owner, authorized by its open state
    New {
        /// The antecedent open stateid
        open_stateid: StateId,
        /// Owner seqid of the OPEN side of the request
        open_seqid: u32,
        /// Seqid of the new lock stateid; must be zero
        lock_seqid: u32,
        /// Opaque bytes of the new lock-owner
        lock_owner: Bytes,
    },
    /// Subsequent lock under an existing lock stateid
    Existing {
        /// The lock stateid from the previous grant
        lock_stateid: StateId,
        /// Owner seqid, current or current+1
        lock_seqid: u32,
    },
}

/// A LOCK request against one file
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Target file
    pub file: FileId,
    /// Requested range
    pub range: LockRange,
    /// Requested type
    pub lock_type: LockType,
    /// Owner designation
    pub locker: Locker,
    /// Whether this is a grace-period reclaim
    pub reclaim: bool,
}

struct FileState {
    states: RwLock<Vec<StateObject>>,
}

/// Registry of all state objects, indexed by file and by stateid name
pub struct StateStore {
    files: DashMap<FileId, Arc<FileState>>,
    index: DashMap<[u8; 12], FileId>,
    counter: AtomicU64,
    epoch: u32,
}

impl StateStore {
    /// Create a store; `epoch` distinguishes this server incarnation's
    /// stateids from any earlier one's
    pub fn new(epoch: u32) -> Self {
        Self {
            files: DashMap::new(),
            index: DashMap::new(),
            counter: AtomicU64::new(1),
            epoch,
        }
    }

    fn alloc_other(&self) -> [u8; 12] {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut other = [0u8; 12];
        other[..8].copy_from_slice(&n.to_be_bytes());
        other[8..].copy_from_slice(&self.epoch.to_be_bytes());
        other
    }

    fn epoch_of(other: &[u8; 12]) -> u32 {
        u32::from_be_bytes([other[8], other[9], other[10], other[11]])
    }

    fn file_state(&self, file: FileId) -> Arc<FileState> {
        Arc::clone(
            &self
                .files
                .entry(file)
                .or_insert_with(|| {
                    Arc::new(FileState {
                        states: RwLock::new(Vec::new()),
                    })
                })
                .value(),
        )
    }

    /// Locate the file a stateid name lives on
    ///
    /// An unknown name from this incarnation is `BadStateid`; a name minted
    /// by a different incarnation is `StaleStateid`.
    fn resolve_file(&self, other: &[u8; 12]) -> StateResult<FileId> {
        if let Some(file) = self.index.get(other) {
            return Ok(*file);
        }
        if Self::epoch_of(other) != self.epoch {
            return Err(StateError::StaleStateid);
        }
        Err(StateError::BadStateid)
    }

    /// Find a state by name in a held file list, distinguishing a foreign
    /// incarnation's name from a plain unknown one
    fn find_mut<'a>(
        &self,
        states: &'a mut [StateObject],
        stateid: &StateId,
    ) -> StateResult<&'a mut StateObject> {
        match states.iter_mut().find(|s| s.other == stateid.other) {
            Some(state) => Ok(state),
            None => {
                if Self::epoch_of(&stateid.other) != self.epoch {
                    Err(StateError::StaleStateid)
                } else {
                    Err(StateError::BadStateid)
                }
            }
        }
    }

    /// Presented-seqid check shared by every stateid-guarded operation
    ///
    /// Zero means "do not check" (the v4.1 convention); an older generation
    /// is `OldStateid`; a generation from the future is `BadStateid`.
    fn check_presented_seqid(presented: u32, current: u32) -> StateResult<()> {
        if presented == 0 || presented == current {
            Ok(())
        } else if presented < current {
            Err(StateError::OldStateid)
        } else {
            Err(StateError::BadStateid)
        }
    }

    /// Create an open (share) state, or upgrade the owner's existing one
    ///
    /// `initial_seqid` seeds the stateid generation of a fresh share state.
    /// A second OPEN by the same owner on the same file merges the requested
    /// bits into the existing state and bumps its generation.
    pub fn open(
        &self,
        file: FileId,
        owner: &OwnerKey,
        owners: &OwnerStore,
        access: ShareAccess,
        deny: ShareDeny,
        initial_seqid: u32,
    ) -> StateResult<StateId> {
        let fstate = self.file_state(file);
        let mut states = fstate.states.write();

        if conflict::find_share_conflict(&states, access, deny, owner) {
            return Err(StateError::ShareDenied);
        }

        if let Some(existing) = states.iter_mut().find(|s| {
            matches!(s.variant, StateVariant::Share(_)) && s.owner().same_entity(owner)
        }) {
            if let StateVariant::Share(ref mut share) = existing.variant {
                share.access = ShareAccess::from_bits(share.access.bits() | access.bits());
                share.deny = ShareDeny::from_bits(share.deny.bits() | deny.bits());
            }
            existing.bump_seqid();
            return Ok(existing.stateid());
        }

        let other = self.alloc_other();
        if !owners.retain(owner) {
            return Err(StateError::ServerFault("open owner vanished".into()));
        }
        states.push(StateObject {
            seqid: initial_seqid,
            other,
            file,
            owner: owner.clone(),
            variant: StateVariant::Share(ShareState {
                access,
                deny,
                lock_count: 0,
            }),
        });
        self.index.insert(other, file);
        debug!(file, seqid = initial_seqid, "granted open state");
        Ok(StateId::new(initial_seqid, other))
    }

    /// Reduce an open state's share bits
    ///
    /// The requested bits must be a subset of what is currently granted.
    pub fn downgrade(
        &self,
        file: FileId,
        open_stateid: StateId,
        access: ShareAccess,
        deny: ShareDeny,
    ) -> StateResult<StateId> {
        let fstate = self.file_state(file);
        let mut states = fstate.states.write();
        let state = self.find_mut(&mut states, &open_stateid)?;

        Self::check_presented_seqid(open_stateid.seqid, state.seqid)?;
        let StateVariant::Share(ref mut share) = state.variant else {
            return Err(StateError::BadStateid);
        };
        if !access.is_subset_of(share.access) || !deny.is_subset_of(share.deny) {
            return Err(StateError::Inval);
        }
        share.access = access;
        share.deny = deny;
        state.bump_seqid();
        Ok(state.stateid())
    }

    /// Acquire a byte-range lock
    ///
    /// Conflict resolution and state mutation happen under one file-list
    /// lock; the `Denied` payload describes the first conflicting state in
    /// list order at that instant.
    pub fn lock(&self, req: &LockRequest, owners: &OwnerStore) -> StateResult<StateId> {
        match &req.locker {
            Locker::New {
                open_stateid,
                open_seqid,
                lock_seqid,
                lock_owner,
            } => self.lock_new_owner(req, owners, open_stateid, *open_seqid, *lock_seqid, lock_owner),
            Locker::Existing {
                lock_stateid,
                lock_seqid,
            } => {
                if lock_stateid.is_special() {
                    // anonymous owner: check only, nothing to record
                    let fstate = self.file_state(req.file);
                    let states = fstate.states.read();
                    let anon = OwnerKey::lock(ClientId::new(0), Bytes::new());
                    if let Some(c) =
                        conflict::find_lock_conflict(&states, &req.range, req.lock_type, &anon)
                    {
                        return Err(StateError::Denied(c));
                    }
                    return Ok(*lock_stateid);
                }
                self.lock_existing_owner(req, lock_stateid, *lock_seqid)
            }
        }
    }

    fn lock_new_owner(
        &self,
        req: &LockRequest,
        owners: &OwnerStore,
        open_stateid: &StateId,
        open_seqid: u32,
        lock_seqid: u32,
        lock_owner: &Bytes,
    ) -> StateResult<StateId> {
        let open_file = self.resolve_file(&open_stateid.other)?;
        if open_file != req.file {
            return Err(StateError::BadStateid);
        }

        let fstate = self.file_state(req.file);
        let mut states = fstate.states.write();

        let (open_idx, open_owner_key, open_state_seqid) = {
            let Some((idx, open)) = states
                .iter()
                .enumerate()
                .find(|(_, s)| s.other == open_stateid.other)
            else {
                return Err(StateError::BadStateid);
            };
            if !matches!(open.variant, StateVariant::Share(_)) {
                return Err(StateError::BadStateid);
            }
            (idx, open.owner().clone(), open.seqid)
        };

        Self::check_presented_seqid(open_stateid.seqid, open_state_seqid)?;
        // the owner's OPEN-side seqid may run at most two ahead of the state
        if open_seqid < open_state_seqid || open_seqid > open_state_seqid.wrapping_add(2) {
            return Err(StateError::BadSeqid);
        }
        if lock_seqid != 0 {
            return Err(StateError::BadSeqid);
        }

        let lock_key = OwnerKey::lock(open_owner_key.client, lock_owner.clone());
        if let Some(c) = conflict::find_lock_conflict(&states, &req.range, req.lock_type, &lock_key)
        {
            return Err(StateError::Denied(c));
        }
        if conflict::share_mode_forbids(&states, req.lock_type) {
            return Err(StateError::OpenMode);
        }

        // the handle's reference becomes the new state's reference
        let _owner = owners.get_or_create_lock(
            open_owner_key.client,
            lock_owner.clone(),
            &open_owner_key,
        );

        let other = self.alloc_other();
        states.push(StateObject {
            seqid: 1,
            other,
            file: req.file,
            owner: lock_key,
            variant: StateVariant::Lock(LockList {
                open_other: open_stateid.other,
                ranges: vec![HeldLock {
                    range: req.range,
                    lock_type: req.lock_type,
                }],
            }),
        });
        if let StateVariant::Share(ref mut share) = states[open_idx].variant {
            share.lock_count += 1;
        }
        self.index.insert(other, req.file);
        debug!(file = req.file, offset = req.range.offset, "granted first lock for new owner");
        Ok(StateId::new(1, other))
    }

    fn lock_existing_owner(
        &self,
        req: &LockRequest,
        lock_stateid: &StateId,
        lock_seqid: u32,
    ) -> StateResult<StateId> {
        let lock_file = self.resolve_file(&lock_stateid.other)?;
        if lock_file != req.file {
            return Err(StateError::BadStateid);
        }

        let fstate = self.file_state(req.file);
        let mut states = fstate.states.write();

        let (idx, cur_seqid, owner_key) = {
            let Some((idx, state)) = states
                .iter()
                .enumerate()
                .find(|(_, s)| s.other == lock_stateid.other)
            else {
                return Err(StateError::BadStateid);
            };
            if !matches!(state.variant, StateVariant::Lock(_)) {
                return Err(StateError::BadStateid);
            }
            (idx, state.seqid, state.owner().clone())
        };

        Self::check_presented_seqid(lock_stateid.seqid, cur_seqid)?;
        if lock_seqid != cur_seqid && lock_seqid != cur_seqid.wrapping_add(1) {
            return Err(StateError::BadSeqid);
        }

        if let Some(c) =
            conflict::find_lock_conflict(&states, &req.range, req.lock_type, &owner_key)
        {
            return Err(StateError::Denied(c));
        }
        if conflict::share_mode_forbids(&states, req.lock_type) {
            return Err(StateError::OpenMode);
        }

        let state = &mut states[idx];
        if let StateVariant::Lock(ref mut locks) = state.variant {
            Self::merge_range(
                &mut locks.ranges,
                HeldLock {
                    range: req.range,
                    lock_type: req.lock_type,
                },
            );
        }
        state.bump_seqid();
        Ok(state.stateid())
    }

    /// Fold a newly granted range into the owner's held list
    ///
    /// Touching or overlapping ranges of the same type coalesce (to a
    /// fixpoint, since each merge can reach further neighbors); spans of the
    /// other type covered by the new range are superseded by it.
    fn merge_range(ranges: &mut Vec<HeldLock>, new: HeldLock) {
        let mut merged = new;
        let mut grew = true;
        while grew {
            grew = false;
            ranges.retain(|held| {
                if held.lock_type == merged.lock_type && held.range.adjoins(&merged.range) {
                    let start = held.range.offset.min(merged.range.offset);
                    let end = held.range.end().max(merged.range.end());
                    merged.range = LockRange {
                        offset: start,
                        length: if end == u64::MAX {
                            crate::conflict::LENGTH_EOF
                        } else {
                            end - start
                        },
                    };
                    grew = true;
                    false
                } else {
                    true
                }
            });
        }
        Self::subtract_range(ranges, &merged.range);
        ranges.push(merged);
    }

    /// Check whether a lock could be granted, without granting it
    ///
    /// `owner` is the would-be holder; `None` scans as an anonymous owner
    /// that matches nothing.
    pub fn test_lock(
        &self,
        file: FileId,
        owner: Option<&OwnerKey>,
        range: &LockRange,
        lock_type: LockType,
    ) -> StateResult<()> {
        let fstate = self.file_state(file);
        let states = fstate.states.read();
        let anon = OwnerKey::lock(ClientId::new(0), Bytes::new());
        let key = owner.unwrap_or(&anon);
        match conflict::find_lock_conflict(&states, range, lock_type, key) {
            Some(c) => Err(StateError::Denied(c)),
            None => Ok(()),
        }
    }

    /// Release part or all of a held range
    ///
    /// Splits held ranges around the released span. When the last range is
    /// gone the lock state itself is destroyed and the antecedent open
    /// state's lock count drops.
    pub fn unlock(
        &self,
        file: FileId,
        lock_stateid: StateId,
        lock_seqid: u32,
        range: &LockRange,
        owners: &OwnerStore,
    ) -> StateResult<StateId> {
        if lock_stateid.is_special() {
            return Err(StateError::BadStateid);
        }
        let lock_file = self.resolve_file(&lock_stateid.other)?;
        if lock_file != file {
            return Err(StateError::BadStateid);
        }

        let fstate = self.file_state(file);
        let mut states = fstate.states.write();

        let Some(idx) = states.iter().position(|s| s.other == lock_stateid.other) else {
            return Err(StateError::BadStateid);
        };
        if !matches!(states[idx].variant, StateVariant::Lock(_)) {
            return Err(StateError::BadStateid);
        }
        Self::check_presented_seqid(lock_stateid.seqid, states[idx].seqid)?;
        let cur = states[idx].seqid;
        if lock_seqid != cur && lock_seqid != cur.wrapping_add(1) {
            return Err(StateError::BadSeqid);
        }

        let (stateid, empty, open_other, owner_key) = {
            let state = &mut states[idx];
            let StateVariant::Lock(ref mut locks) = state.variant else {
                return Err(StateError::BadStateid);
            };
            Self::subtract_range(&mut locks.ranges, range);
            let empty = locks.ranges.is_empty();
            let open_other = locks.open_other;
            state.bump_seqid();
            (state.stateid(), empty, open_other, state.owner().clone())
        };

        if empty {
            states.remove(idx);
            self.index.remove(&lock_stateid.other);
            if let Some(open) = states.iter_mut().find(|s| s.other == open_other) {
                if let StateVariant::Share(ref mut share) = open.variant {
                    share.lock_count = share.lock_count.saturating_sub(1);
                }
            }
            owners.release_key(&owner_key);
        }
        Ok(stateid)
    }

    /// Remove `cut` from every held range, splitting as needed
    fn subtract_range(ranges: &mut Vec<HeldLock>, cut: &LockRange) {
        let mut result = Vec::with_capacity(ranges.len());
        for held in ranges.drain(..) {
            if !held.range.overlaps(cut) {
                result.push(held);
                continue;
            }
            if held.range.offset < cut.offset {
                result.push(HeldLock {
                    range: LockRange {
                        offset: held.range.offset,
                        length: cut.offset - held.range.offset,
                    },
                    lock_type: held.lock_type,
                });
            }
            if cut.end() < held.range.end() {
                result.push(HeldLock {
                    range: LockRange {
                        offset: cut.end(),
                        length: if held.range.end() == u64::MAX {
                            crate::conflict::LENGTH_EOF
                        } else {
                            held.range.end() - cut.end()
                        },
                    },
                    lock_type: held.lock_type,
                });
            }
        }
        *ranges = result;
    }

    /// Close an open state
    ///
    /// Refused with `LocksHeld` while lock states still derive from it.
    pub fn close(
        &self,
        file: FileId,
        open_stateid: StateId,
        owners: &OwnerStore,
    ) -> StateResult<()> {
        let open_file = self.resolve_file(&open_stateid.other)?;
        if open_file != file {
            return Err(StateError::BadStateid);
        }

        let fstate = self.file_state(file);
        let mut states = fstate.states.write();

        let Some(idx) = states.iter().position(|s| s.other == open_stateid.other) else {
            return Err(StateError::BadStateid);
        };
        Self::check_presented_seqid(open_stateid.seqid, states[idx].seqid)?;
        match states[idx].variant {
            StateVariant::Share(ref share) => {
                if share.lock_count > 0 {
                    return Err(StateError::LocksHeld);
                }
            }
            _ => return Err(StateError::BadStateid),
        }

        let state = states.remove(idx);
        self.index.remove(&open_stateid.other);
        owners.release_key(state.owner());
        debug!(file, "closed open state");
        Ok(())
    }

    /// Free a lock-owner once it holds nothing
    ///
    /// Lock states die with their last range, so any surviving lock state
    /// for this owner means locks are still held and the owner cannot be
    /// released yet.
    pub fn release_lockowner(&self, owner: &OwnerKey) -> StateResult<()> {
        let files: Vec<FileId> = self.files.iter().map(|e| *e.key()).collect();
        for file in files {
            let Some(fstate) = self.files.get(&file).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let states = fstate.states.read();
            if states
                .iter()
                .any(|s| s.owner().same_entity(owner) && matches!(s.variant, StateVariant::Lock(_)))
            {
                return Err(StateError::LocksHeld);
            }
        }
        Ok(())
    }

    /// Create a delegation state (pass-through payload)
    pub fn add_delegation(
        &self,
        file: FileId,
        owner: &OwnerKey,
        owners: &OwnerStore,
        kind: DelegationKind,
        handle: Bytes,
    ) -> StateResult<StateId> {
        let fstate = self.file_state(file);
        let mut states = fstate.states.write();

        let other = self.alloc_other();
        if !owners.retain(owner) {
            return Err(StateError::ServerFault("delegation owner vanished".into()));
        }
        states.push(StateObject {
            seqid: 1,
            other,
            file,
            owner: owner.clone(),
            variant: StateVariant::Delegation(DelegationState { kind, handle }),
        });
        self.index.insert(other, file);
        Ok(StateId::new(1, other))
    }

    /// Return (destroy) a delegation state
    pub fn return_delegation(
        &self,
        file: FileId,
        stateid: StateId,
        owners: &OwnerStore,
    ) -> StateResult<()> {
        let deleg_file = self.resolve_file(&stateid.other)?;
        if deleg_file != file {
            return Err(StateError::BadStateid);
        }
        let fstate = self.file_state(file);
        let mut states = fstate.states.write();
        let Some(idx) = states.iter().position(|s| s.other == stateid.other) else {
            return Err(StateError::BadStateid);
        };
        if !matches!(states[idx].variant, StateVariant::Delegation(_)) {
            return Err(StateError::BadStateid);
        }
        let state = states.remove(idx);
        self.index.remove(&stateid.other);
        owners.release_key(state.owner());
        Ok(())
    }

    /// Inspect a state object by stateid name
    pub fn with_state<T>(
        &self,
        other: &[u8; 12],
        f: impl FnOnce(&StateObject) -> T,
    ) -> StateResult<T> {
        let file = self.resolve_file(other)?;
        let fstate = self.file_state(file);
        let states = fstate.states.read();
        let Some(state) = states.iter().find(|s| s.other == *other) else {
            return Err(StateError::BadStateid);
        };
        if state.file() != file {
            error!(file, "state object resolved to a different file");
            return Err(StateError::BadStateid);
        }
        Ok(f(state))
    }

    /// Destroy every state object owned by `client`, returning the
    /// filehandles of its write delegations so the caller can record them as
    /// revoked in the client's recovery record
    pub fn expire_client(&self, client: ClientId, owners: &OwnerStore) -> Vec<Bytes> {
        let mut revoked = Vec::new();
        let files: Vec<FileId> = self.files.iter().map(|e| *e.key()).collect();
        for file in files {
            let Some(fstate) = self.files.get(&file).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let mut states = fstate.states.write();
            let mut removed = Vec::new();
            states.retain(|s| {
                if s.owner().client == client {
                    removed.push(s.clone());
                    false
                } else {
                    true
                }
            });
            for state in removed {
                self.index.remove(&state.other());
                if let StateVariant::Delegation(ref deleg) = state.variant {
                    if deleg.kind == DelegationKind::Write {
                        revoked.push(deleg.handle.clone());
                    }
                }
                owners.release_key(state.owner());
            }
        }
        debug!(client = client.value(), revoked = revoked.len(), "expired client state");
        revoked
    }

    /// Number of live states on a file
    pub fn file_state_count(&self, file: FileId) -> usize {
        self.files
            .get(&file)
            .map(|f| f.states.read().len())
            .unwrap_or(0)
    }

    /// Total number of live states
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the store holds no state
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
