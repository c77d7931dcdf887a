//! quay-state: State abstraction layer for the Quay file-service gateway
//!
//! This crate is the stateful core of an NFS server: it tracks who a client
//! is, what it has open, which byte ranges it has locked, and what it may
//! reclaim after a crash — without touching wire formats or storage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   register/confirm   ┌─────────────────┐
//! │ClientRegistry│◄─────────────────────│ protocol layer  │
//! └──────┬───────┘                      └────────┬────────┘
//!        │ expire                                │ open/lock
//! ┌──────▼───────┐   seqid-gated ops    ┌────────▼────────┐
//! │  StateStore  │◄─────────────────────│   OwnerStore    │
//! └──────┬───────┘                      └─────────────────┘
//!        │ reclaim gating
//! ┌──────▼────────────┐   records   ┌──────────────────┐
//! │GracePeriodManager │◄────────────│  RecoveryLedger  │
//! └───────────────────┘             └──────────────────┘
//! ```
//!
//! Every registry leans on one [`RefCountedStore`]: a race-safe interning
//! table where release and get-or-create may collide without ever handing a
//! destroyed object to a caller.

#![warn(missing_docs)]

pub mod client;
pub mod conflict;
pub mod error;
pub mod filehandle;
pub mod grace;
pub mod nlm;
pub mod owner;
pub mod recovery;
pub mod state_table;
pub mod store;

pub use client::{
    CallbackInfo, ClientId, ClientIdRecord, ClientRegistry, ConfirmState, Principal, Verifier,
    Want,
};
pub use conflict::{LockRange, LockType, LENGTH_EOF};
pub use error::{ConflictingLock, StateError, StateResult};
pub use filehandle::{FileHandle, FileId, FileIdentityProvider, FileKind, MapIdentityProvider};
pub use grace::{GraceConfig, GraceEvent, GraceGuard, GracePeriodManager};
pub use nlm::{Care, NlmClientOwnerCache, NoopMonitor, NsmMonitor, TransportKind};
pub use owner::{OwnerHandle, OwnerKey, OwnerKind, OwnerStore};
pub use recovery::{
    ClusterHooks, DirLedger, LocalNode, MemoryLedger, RecoveryLedger, RecoveryRecord,
};
pub use state_table::{
    DelegationKind, DelegationState, HeldLock, Locker, LockList, LockRequest, ShareAccess,
    ShareDeny, ShareState, StateId, StateObject, StateStore, StateVariant,
};
pub use store::{Handle, RefCountedStore};
