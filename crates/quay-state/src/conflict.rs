//! Byte-range overlap and share-mode conflict resolution
//!
//! One half-open interval test serves both the v4.0 and v4.1 lock paths.
//! The first conflicting state found in the file's list order wins the
//! `Denied` payload; the scan does not look for the lowest offset.

use crate::error::{ConflictingLock, StateError, StateResult};
use crate::owner::OwnerKey;
use crate::state_table::{ShareAccess, ShareDeny, StateObject, StateVariant};

/// Length sentinel meaning "from offset to end of file"
pub const LENGTH_EOF: u64 = u64::MAX;

/// Byte-range lock type (wire values from RFC 7530)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockType {
    /// Read lock
    ReadLt = 1,
    /// Write lock
    WriteLt = 2,
    /// Read lock, blocking variant
    ReadW = 3,
    /// Write lock, blocking variant
    WriteW = 4,
}

impl TryFrom<u32> for LockType {
    type Error = StateError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ReadLt),
            2 => Ok(Self::WriteLt),
            3 => Ok(Self::ReadW),
            4 => Ok(Self::WriteW),
            _ => Err(StateError::Inval),
        }
    }
}

impl LockType {
    /// Whether this is a write lock
    pub fn is_write(&self) -> bool {
        matches!(self, Self::WriteLt | Self::WriteW)
    }

    /// Whether the client asked to wait for the lock
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::ReadW | Self::WriteW)
    }
}

/// A validated byte range
///
/// `length == LENGTH_EOF` means "to end of file"; any other length must keep
/// `offset + length` within the 64-bit range, and zero-length ranges are
/// rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    /// Start offset
    pub offset: u64,
    /// Length, or [`LENGTH_EOF`]
    pub length: u64,
}

impl LockRange {
    /// Validate and build a range
    pub fn new(offset: u64, length: u64) -> StateResult<Self> {
        if length == 0 {
            return Err(StateError::Inval);
        }
        if length != LENGTH_EOF && offset.checked_add(length).is_none() {
            return Err(StateError::Inval);
        }
        Ok(Self { offset, length })
    }

    /// Exclusive end of the range
    pub fn end(&self) -> u64 {
        if self.length == LENGTH_EOF {
            u64::MAX
        } else {
            self.offset + self.length
        }
    }

    /// Half-open interval intersection test
    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Whether `other` lies entirely within this range
    pub fn contains(&self, other: &LockRange) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    /// Whether the two ranges touch or overlap (mergeable)
    pub fn adjoins(&self, other: &LockRange) -> bool {
        self.overlaps(other) || self.end() == other.offset || other.end() == self.offset
    }
}

/// Find the first lock state that defeats the candidate request
///
/// Iterates `Lock`-typed states in list order; within a state, held ranges in
/// insertion order. An overlap conflicts only when at least one side is a
/// write lock and the owners differ — the same owner re-locking its own range
/// is permitted and the scan continues past it.
pub(crate) fn find_lock_conflict(
    states: &[StateObject],
    range: &LockRange,
    lock_type: LockType,
    owner: &OwnerKey,
) -> Option<ConflictingLock> {
    for state in states {
        let StateVariant::Lock(ref locks) = state.variant else {
            continue;
        };
        if state.owner().same_entity(owner) {
            continue;
        }
        for held in &locks.ranges {
            if !held.range.overlaps(range) {
                continue;
            }
            if held.lock_type.is_write() || lock_type.is_write() {
                return Some(ConflictingLock {
                    offset: held.range.offset,
                    length: held.range.length,
                    lock_type: held.lock_type,
                    client: state.owner().client_value(),
                    owner: state.owner().owner.clone(),
                });
            }
        }
    }
    None
}

/// Whether an existing share reservation forbids a write lock
///
/// A share that denies WRITE without holding WRITE access itself blocks any
/// write-type lock from other openers.
pub(crate) fn share_mode_forbids(states: &[StateObject], lock_type: LockType) -> bool {
    if !lock_type.is_write() {
        return false;
    }
    states.iter().any(|state| match state.variant {
        StateVariant::Share(ref share) => {
            share.deny.contains(ShareDeny::WRITE) && !share.access.contains(ShareAccess::WRITE)
        }
        _ => false,
    })
}

/// OPEN-time share reservation check
///
/// A new open conflicts when an existing share from a different owner denies
/// any of the requested access, or the requested deny covers any access the
/// existing share holds.
pub(crate) fn find_share_conflict(
    states: &[StateObject],
    access: ShareAccess,
    deny: ShareDeny,
    owner: &OwnerKey,
) -> bool {
    states.iter().any(|state| match state.variant {
        StateVariant::Share(ref share) => {
            if state.owner().same_entity(owner) {
                return false;
            }
            share.deny.bits() & access.bits() != 0 || deny.bits() & share.access.bits() != 0
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert!(LockRange::new(0, 0).is_err());
        assert!(LockRange::new(10, u64::MAX - 5).is_err());
        assert!(LockRange::new(0, 100).is_ok());
        assert!(LockRange::new(7, LENGTH_EOF).is_ok());
        assert!(LockRange::new(u64::MAX - 1, 1).is_ok());
    }

    #[test]
    fn test_half_open_overlap() {
        let a = LockRange::new(0, 100).unwrap();
        let b = LockRange::new(100, 50).unwrap();
        let c = LockRange::new(99, 1).unwrap();

        // [0,100) and [100,150) share no byte
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(!b.overlaps(&c));
    }

    #[test]
    fn test_eof_range_overlaps_everything_past_offset() {
        let tail = LockRange::new(1000, LENGTH_EOF).unwrap();
        let before = LockRange::new(0, 1000).unwrap();
        let after = LockRange::new(5000, 1).unwrap();

        assert!(!tail.overlaps(&before));
        assert!(tail.overlaps(&after));
        assert_eq!(tail.end(), u64::MAX);
    }

    #[test]
    fn test_adjoining_ranges() {
        let a = LockRange::new(0, 10).unwrap();
        let b = LockRange::new(10, 10).unwrap();
        let c = LockRange::new(21, 4).unwrap();

        assert!(a.adjoins(&b));
        assert!(!a.adjoins(&c));
        assert!(!b.adjoins(&c));
    }

    #[test]
    fn test_lock_type_flags() {
        assert!(LockType::WriteLt.is_write());
        assert!(LockType::WriteW.is_write());
        assert!(!LockType::ReadLt.is_write());
        assert!(LockType::ReadW.is_blocking());
        assert!(!LockType::WriteLt.is_blocking());
    }
}
