//! NFS error types and wire status codes

use thiserror::Error;

use quay_state::StateError;

/// NFS protocol-layer error types
#[derive(Debug, Error)]
pub enum NfsError {
    /// State-layer error
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// NFS protocol error carrying a wire status
    #[error("NFS error: {0}")]
    Protocol(NfsStatus),

    /// Session error
    #[error("session error: {0}")]
    Session(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NfsError {
    /// The wire status this error surfaces as
    pub fn status(&self) -> NfsStatus {
        match self {
            NfsError::State(err) => NfsStatus::from_state(err),
            NfsError::Protocol(status) => *status,
            NfsError::Session(_) => NfsStatus::BadSession,
            NfsError::Io(_) => NfsStatus::Serverfault,
        }
    }
}

/// NFS status codes (RFC 7530 / RFC 8881)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NfsStatus {
    /// Success
    Ok = 0,
    /// Permission denied
    Perm = 1,
    /// No such file or directory
    Noent = 2,
    /// I/O error
    Io = 5,
    /// Access denied
    Access = 13,
    /// Invalid argument
    Inval = 22,
    /// Stale file handle
    Stale = 70,
    /// Bad file handle
    Badhandle = 10001,
    /// Not supported
    Notsupp = 10004,
    /// Server fault
    Serverfault = 10006,
    /// Delay, retry later
    Delay = 10008,
    /// Lock range conflict
    Denied = 10010,
    /// Client lease expired
    Expired = 10011,
    /// File is locked
    Locked = 10012,
    /// Grace period in effect
    Grace = 10013,
    /// File handle expired
    Fhexpired = 10014,
    /// Share reservation denied
    ShareDenied = 10015,
    /// Client ID in use
    ClidInuse = 10017,
    /// Resource exhaustion
    Resource = 10018,
    /// No filehandle set
    NoFileHandle = 10020,
    /// Stale client ID
    StaleClientid = 10022,
    /// Stale stateid
    StaleStateid = 10023,
    /// Old stateid
    OldStateid = 10024,
    /// Bad stateid
    BadStateid = 10025,
    /// Bad sequence ID
    BadSeqid = 10026,
    /// No grace period in effect
    NoGrace = 10033,
    /// Reclaim not permitted
    ReclaimBad = 10034,
    /// Locks still held
    LocksHeld = 10037,
    /// Open mode forbids operation
    Openmode = 10038,
    /// Illegal operation
    OpIllegal = 10044,
    /// Bad session
    BadSession = 10052,
    /// Bad slot id
    BadSlot = 10053,
    /// Reclaim already complete
    CompleteAlready = 10054,
    /// Sequence misordered
    SeqMisordered = 10063,
    /// Operation must be the only one in the compound
    NotOnlyOp = 10081,
}

impl NfsStatus {
    /// Map a state-layer error to its wire status
    pub fn from_state(err: &StateError) -> Self {
        match err {
            StateError::StaleClientId => Self::StaleClientid,
            StateError::BadHandle => Self::Badhandle,
            StateError::FhExpired => Self::Fhexpired,
            StateError::ClidInUse => Self::ClidInuse,
            StateError::BadStateid => Self::BadStateid,
            StateError::OldStateid => Self::OldStateid,
            StateError::BadSeqid => Self::BadSeqid,
            StateError::StaleStateid => Self::StaleStateid,
            StateError::Denied(_) => Self::Denied,
            StateError::ShareDenied => Self::ShareDenied,
            StateError::OpenMode => Self::Openmode,
            StateError::LocksHeld => Self::LocksHeld,
            StateError::NotOnlyOp => Self::NotOnlyOp,
            StateError::SeqMisordered => Self::SeqMisordered,
            StateError::BadSession => Self::BadSession,
            StateError::GraceActive => Self::Grace,
            StateError::NoGrace => Self::NoGrace,
            StateError::ReclaimBad => Self::ReclaimBad,
            StateError::CompleteAlready => Self::CompleteAlready,
            // internal retry signal; a client should never see it, but the
            // closest wire meaning is "try again"
            StateError::GraceRetry => Self::Delay,
            StateError::Expired => Self::Expired,
            StateError::ServerFault(_) => Self::Serverfault,
            StateError::Notsupp => Self::Notsupp,
            StateError::Inval => Self::Inval,
        }
    }
}

impl std::fmt::Display for NfsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NfsStatus::Ok => "NFS4_OK",
            NfsStatus::Perm => "NFS4ERR_PERM",
            NfsStatus::Noent => "NFS4ERR_NOENT",
            NfsStatus::Io => "NFS4ERR_IO",
            NfsStatus::Access => "NFS4ERR_ACCESS",
            NfsStatus::Inval => "NFS4ERR_INVAL",
            NfsStatus::Stale => "NFS4ERR_STALE",
            NfsStatus::Badhandle => "NFS4ERR_BADHANDLE",
            NfsStatus::Notsupp => "NFS4ERR_NOTSUPP",
            NfsStatus::Serverfault => "NFS4ERR_SERVERFAULT",
            NfsStatus::Delay => "NFS4ERR_DELAY",
            NfsStatus::Denied => "NFS4ERR_DENIED",
            NfsStatus::Expired => "NFS4ERR_EXPIRED",
            NfsStatus::Locked => "NFS4ERR_LOCKED",
            NfsStatus::Grace => "NFS4ERR_GRACE",
            NfsStatus::Fhexpired => "NFS4ERR_FHEXPIRED",
            NfsStatus::ShareDenied => "NFS4ERR_SHARE_DENIED",
            NfsStatus::ClidInuse => "NFS4ERR_CLID_INUSE",
            NfsStatus::Resource => "NFS4ERR_RESOURCE",
            NfsStatus::NoFileHandle => "NFS4ERR_NOFILEHANDLE",
            NfsStatus::StaleClientid => "NFS4ERR_STALE_CLIENTID",
            NfsStatus::StaleStateid => "NFS4ERR_STALE_STATEID",
            NfsStatus::OldStateid => "NFS4ERR_OLD_STATEID",
            NfsStatus::BadStateid => "NFS4ERR_BAD_STATEID",
            NfsStatus::BadSeqid => "NFS4ERR_BAD_SEQID",
            NfsStatus::NoGrace => "NFS4ERR_NO_GRACE",
            NfsStatus::ReclaimBad => "NFS4ERR_RECLAIM_BAD",
            NfsStatus::LocksHeld => "NFS4ERR_LOCKS_HELD",
            NfsStatus::Openmode => "NFS4ERR_OPENMODE",
            NfsStatus::OpIllegal => "NFS4ERR_OP_ILLEGAL",
            NfsStatus::BadSession => "NFS4ERR_BADSESSION",
            NfsStatus::BadSlot => "NFS4ERR_BADSLOT",
            NfsStatus::CompleteAlready => "NFS4ERR_COMPLETE_ALREADY",
            NfsStatus::SeqMisordered => "NFS4ERR_SEQ_MISORDERED",
            NfsStatus::NotOnlyOp => "NFS4ERR_NOT_ONLY_OP",
        };
        write!(f, "{}", name)
    }
}

/// Result type for NFS operations
pub type NfsResult<T> = Result<T, NfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_mapping() {
        assert_eq!(
            NfsStatus::from_state(&StateError::StaleClientId),
            NfsStatus::StaleClientid
        );
        assert_eq!(
            NfsStatus::from_state(&StateError::GraceActive),
            NfsStatus::Grace
        );
        assert_eq!(NfsStatus::from_state(&StateError::Inval), NfsStatus::Inval);
    }

    #[test]
    fn test_display_wire_names() {
        assert_eq!(NfsStatus::Ok.to_string(), "NFS4_OK");
        assert_eq!(NfsStatus::BadSeqid.to_string(), "NFS4ERR_BAD_SEQID");
        assert_eq!(
            NfsStatus::SeqMisordered.to_string(),
            "NFS4ERR_SEQ_MISORDERED"
        );
    }

    #[test]
    fn test_error_status_passthrough() {
        let err = NfsError::from(StateError::BadStateid);
        assert_eq!(err.status(), NfsStatus::BadStateid);
        assert_eq!(
            NfsError::Protocol(NfsStatus::BadSlot).status(),
            NfsStatus::BadSlot
        );
    }
}
