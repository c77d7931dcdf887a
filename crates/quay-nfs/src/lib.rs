//! quay-nfs: NFSv4.1 protocol layer for the Quay file-service gateway
//!
//! Builds the protocol-facing surface over [`quay_state`]: sessions with
//! exactly-once compound execution, the duplicate-request cache, stateful
//! operation handlers, and the service object that owns every registry.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │ RPC layer   │  (parsed operations in, results out)
//! └──────┬──────┘
//!        │ CompoundRequest
//! ┌──────▼──────┐
//! │  compound   │── SEQUENCE ──► SessionManager / DRC
//! │   + ops     │── OPEN/LOCK ─► quay-state stores, grace-gated
//! └──────┬──────┘
//!        │
//! ┌──────▼──────┐
//! │StateService │  registries, reaper, recovery ledger
//! └─────────────┘
//! ```

#![warn(missing_docs)]

pub mod compound;
pub mod config;
pub mod error;
pub mod ops;
pub mod service;
pub mod session;

pub use compound::{execute, CompoundContext, CompoundReply, CompoundRequest, OpCode};
pub use config::NfsConfig;
pub use error::{NfsError, NfsResult, NfsStatus};
pub use ops::{OpArgs, OpBody, OpResult};
pub use service::{StateService, StateServiceBuilder};
pub use session::{
    CachedReply, ChannelAttrs, CreateSessionReply, SequenceDisposition, Session, SessionId,
    SessionManager, SessionSlot,
};
