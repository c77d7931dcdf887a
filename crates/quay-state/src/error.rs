//! Error types for state-layer operations

use bytes::Bytes;
use thiserror::Error;

use crate::conflict::LockType;

/// Description of the lock that defeated a LOCK or LOCKT request.
///
/// Carries the exact range, type, and owner of the first conflicting state
/// encountered during the conflict scan, in the form the protocol reports
/// back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingLock {
    /// Start offset of the conflicting range
    pub offset: u64,
    /// Length of the conflicting range
    pub length: u64,
    /// Type of the conflicting lock
    pub lock_type: LockType,
    /// Client holding the conflicting lock
    pub client: u64,
    /// Opaque owner bytes of the conflicting lock-owner
    pub owner: Bytes,
}

/// State-layer error taxonomy
///
/// Every variant except `GraceRetry` and `ServerFault` is client-visible and
/// maps to a protocol status code in the protocol layer. `GraceRetry` is
/// consumed by the control loop that initiates grace transitions and never
/// reaches a client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Client ID is not known to this server incarnation
    #[error("stale client id")]
    StaleClientId,

    /// Filehandle could not be resolved
    #[error("bad filehandle")]
    BadHandle,

    /// Filehandle refers to an object that no longer exists
    #[error("filehandle expired")]
    FhExpired,

    /// Client ID is registered to a different principal
    #[error("client id in use by another principal")]
    ClidInUse,

    /// Stateid does not name a live state, or names state of the wrong kind
    #[error("bad stateid")]
    BadStateid,

    /// Stateid seqid is older than the current state generation
    #[error("old stateid")]
    OldStateid,

    /// Owner seqid outside the accepted replay window
    #[error("bad sequence id")]
    BadSeqid,

    /// Stateid was issued by a previous server incarnation
    #[error("stale stateid")]
    StaleStateid,

    /// Byte-range lock conflict
    #[error("lock denied by conflicting lock at {}..{} held by client {:#x}", .0.offset, .0.length, .0.client)]
    Denied(ConflictingLock),

    /// An existing share reservation denies the requested access
    #[error("share reservation denies the requested access")]
    ShareDenied,

    /// A share reservation's deny bits forbid this lock or I/O mode
    #[error("open mode forbids the requested operation")]
    OpenMode,

    /// Open state still carries byte-range locks
    #[error("locks still held under this open")]
    LocksHeld,

    /// Operation must be the only one in its compound
    #[error("operation must be the only operation in the compound")]
    NotOnlyOp,

    /// Slot sequence id is neither current nor the immediate replay
    #[error("sequence misordered")]
    SeqMisordered,

    /// Session id does not name a live session
    #[error("unknown session")]
    BadSession,

    /// Non-reclaim operation attempted while the grace period is active
    #[error("grace period in effect")]
    GraceActive,

    /// Reclaim attempted outside the grace period
    #[error("no grace period in effect")]
    NoGrace,

    /// Reclaim attempted by a client unknown to the previous incarnation
    #[error("reclaim not permitted for this client")]
    ReclaimBad,

    /// RECLAIM_COMPLETE received twice from the same client
    #[error("reclaim already complete")]
    CompleteAlready,

    /// Grace transition pending; the initiating loop must retry
    #[error("grace state change pending, retry")]
    GraceRetry,

    /// Client lease has expired
    #[error("client lease expired")]
    Expired,

    /// Allocation failure or internal invariant violation
    #[error("server fault: {0}")]
    ServerFault(String),

    /// Operation is recognized but not supported
    #[error("not supported")]
    Notsupp,

    /// Malformed argument (zero-length range, range overflow, non-subset downgrade)
    #[error("invalid argument")]
    Inval,
}

/// Result type for state-layer operations
pub type StateResult<T> = Result<T, StateError>;
