//! Compound execution
//!
//! Operations run strictly in order. The first non-OK status stops the
//! compound; every result up to and including the failing operation is
//! preserved, and whatever the failing operation had already applied stays
//! applied. A compound answered from the duplicate-request cache carries the
//! cached reply instead of fresh results.

use std::sync::Arc;

use bytes::Bytes;

use quay_state::{ClientIdRecord, FileHandle, StateId};

use crate::error::NfsStatus;
use crate::ops::{self, OpArgs, OpResult};
use crate::service::StateService;
use crate::session::{CachedReply, Session};

/// Operation codes (RFC 7530 / RFC 8881), trimmed to the stateful set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpCode {
    /// CLOSE
    Close = 4,
    /// DELEGRETURN
    DelegReturn = 8,
    /// LOCK
    Lock = 12,
    /// LOCKT
    LockT = 13,
    /// LOCKU
    LockU = 14,
    /// OPEN
    Open = 18,
    /// OPEN_DOWNGRADE
    OpenDowngrade = 21,
    /// PUTFH
    PutFh = 22,
    /// RENEW
    Renew = 30,
    /// SETCLIENTID
    SetClientId = 35,
    /// SETCLIENTID_CONFIRM
    SetClientIdConfirm = 36,
    /// RELEASE_LOCKOWNER
    ReleaseLockOwner = 39,
    /// EXCHANGE_ID
    ExchangeId = 42,
    /// CREATE_SESSION
    CreateSession = 43,
    /// DESTROY_SESSION
    DestroySession = 44,
    /// SEQUENCE
    Sequence = 53,
    /// RECLAIM_COMPLETE
    ReclaimComplete = 58,
    /// Illegal operation marker
    Illegal = 10044,
}

/// Per-compound execution state
pub struct CompoundContext {
    /// Protocol minor version of the compound
    pub minor_version: u32,
    /// Client resolved by SEQUENCE or a v4.0 clientid argument
    pub client: Option<Arc<ClientIdRecord>>,
    /// Session bound by SEQUENCE
    pub session: Option<Arc<Session>>,
    /// Slot and sequence id bound by SEQUENCE
    pub slot: Option<(u32, u32)>,
    /// Current filehandle
    pub current_fh: Option<FileHandle>,
    /// Stateid produced by the most recent state-mutating op
    pub current_stateid: Option<StateId>,
    pub(crate) replay: Option<CachedReply>,
}

impl CompoundContext {
    /// Fresh context for one compound
    pub fn new(minor_version: u32) -> Self {
        Self {
            minor_version,
            client: None,
            session: None,
            slot: None,
            current_fh: None,
            current_stateid: None,
            replay: None,
        }
    }

    /// Current filehandle, or the protocol error for its absence
    pub fn require_fh(&self) -> Result<&FileHandle, NfsStatus> {
        self.current_fh.as_ref().ok_or(NfsStatus::NoFileHandle)
    }
}

/// A parsed compound request
#[derive(Debug, Clone)]
pub struct CompoundRequest {
    /// Client-chosen tag, echoed in the reply
    pub tag: String,
    /// Protocol minor version
    pub minor_version: u32,
    /// Operations in execution order
    pub ops: Vec<OpArgs>,
}

/// A compound reply
#[derive(Debug, Clone)]
pub struct CompoundReply {
    /// Status of the compound (the last executed operation's status)
    pub status: NfsStatus,
    /// Echoed tag
    pub tag: String,
    /// Results up to and including the first failing operation
    pub results: Vec<OpResult>,
    /// Set when the compound was answered from the duplicate-request cache
    pub replay: Option<CachedReply>,
}

impl CompoundReply {
    /// Empty successful reply
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            status: NfsStatus::Ok,
            tag: tag.into(),
            results: Vec::new(),
            replay: None,
        }
    }

    /// Append a result, adopting its status on failure
    pub fn add_result(&mut self, result: OpResult) {
        if result.status != NfsStatus::Ok {
            self.status = result.status;
        }
        self.results.push(result);
    }
}

/// Execute a compound against the service
pub fn execute(service: &Arc<StateService>, request: &CompoundRequest) -> CompoundReply {
    let mut reply = CompoundReply::new(request.tag.clone());
    if request.ops.is_empty() {
        return reply;
    }
    if request.ops.len() > service.config().max_compound_ops {
        reply.status = NfsStatus::Resource;
        return reply;
    }

    // a v4.1 compound either starts with SEQUENCE or is a singleton of the
    // session-less operations
    if request.minor_version >= 1
        && request.ops.len() > 1
        && !matches!(request.ops[0], OpArgs::Sequence(_))
    {
        reply.add_result(OpResult::error(request.ops[0].code(), NfsStatus::NotOnlyOp));
        return reply;
    }

    let mut ctx = CompoundContext::new(request.minor_version);
    for args in &request.ops {
        let result = ops::dispatch(service, &mut ctx, args);

        if let Some(cached) = ctx.replay.take() {
            return CompoundReply {
                status: cached.status,
                tag: request.tag.clone(),
                results: Vec::new(),
                replay: Some(cached),
            };
        }

        let status = result.status;
        reply.add_result(result);
        if status != NfsStatus::Ok {
            break;
        }
    }

    // remember the outcome in the slot's duplicate-request cache; the
    // transport layer swaps in the encoded body when it has one
    if let (Some(ref session), Some((slot, seqid))) = (&ctx.session, ctx.slot) {
        let _ = session.complete(
            slot,
            CachedReply {
                seqid,
                status: reply.status,
                body: Bytes::new(),
            },
        );
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpBody;

    #[test]
    fn test_reply_adopts_first_failure() {
        let mut reply = CompoundReply::new("t");
        reply.add_result(OpResult::ok(OpCode::PutFh, OpBody::PutFh));
        assert_eq!(reply.status, NfsStatus::Ok);

        reply.add_result(OpResult::error(OpCode::Lock, NfsStatus::Denied));
        assert_eq!(reply.status, NfsStatus::Denied);
        assert_eq!(reply.results.len(), 2);
    }

    #[test]
    fn test_context_requires_fh() {
        let ctx = CompoundContext::new(0);
        assert_eq!(ctx.require_fh().unwrap_err(), NfsStatus::NoFileHandle);
    }
}
