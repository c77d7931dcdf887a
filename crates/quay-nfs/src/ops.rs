//! Stateful operation handlers
//!
//! Each handler translates an already-parsed operation into calls against
//! the state layer, under the grace-period gating the protocol requires:
//! reclaims only during grace and only for clients the previous incarnation
//! knew; everything else only outside it.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use quay_state::{
    CallbackInfo, ClientId, ConfirmState, ConflictingLock, LockRange, LockRequest, LockType,
    Locker, OwnerKey, Principal, ShareAccess, ShareDeny, StateError, StateId, Verifier, Want,
};

use crate::compound::{CompoundContext, OpCode};
use crate::error::{NfsError, NfsResult, NfsStatus};
use crate::service::StateService;
use crate::session::{ChannelAttrs, CreateSessionReply, SequenceDisposition, SessionId};

/// SETCLIENTID arguments
#[derive(Debug, Clone)]
pub struct SetClientIdArgs {
    /// Registering principal (owner bytes + resolved caller address)
    pub principal: Principal,
    /// Client boot verifier
    pub verifier: Verifier,
    /// Callback channel details
    pub callback: CallbackInfo,
}

/// SETCLIENTID_CONFIRM arguments
#[derive(Debug, Clone)]
pub struct SetClientIdConfirmArgs {
    /// Clientid being confirmed
    pub clientid: u64,
    /// Confirmation verifier
    pub verifier: Verifier,
    /// Caller principal, for the masquerade check
    pub principal: Principal,
}

/// EXCHANGE_ID arguments
#[derive(Debug, Clone)]
pub struct ExchangeIdArgs {
    /// Registering principal
    pub principal: Principal,
    /// Client boot verifier
    pub verifier: Verifier,
}

/// CREATE_SESSION arguments
#[derive(Debug, Clone)]
pub struct CreateSessionArgs {
    /// Owning clientid
    pub clientid: u64,
    /// Creation sequence for exactly-once execution
    pub seq: u32,
    /// Requested fore channel attributes
    pub fore_channel: ChannelAttrs,
}

/// SEQUENCE arguments
#[derive(Debug, Clone)]
pub struct SequenceArgs {
    /// Session this compound runs under
    pub session: SessionId,
    /// Slot id
    pub slot: u32,
    /// Per-slot sequence id
    pub seqid: u32,
}

/// OPEN arguments (stateful portion)
#[derive(Debug, Clone)]
pub struct OpenArgs {
    /// v4.0 clientid; v4.1 compounds carry the client on the session
    pub clientid: Option<u64>,
    /// Open-owner opaque bytes
    pub owner: Bytes,
    /// Requested access bits
    pub access: ShareAccess,
    /// Requested deny bits
    pub deny: ShareDeny,
    /// Whether this OPEN reclaims state from before a restart
    pub reclaim: bool,
}

/// OPEN_DOWNGRADE arguments
#[derive(Debug, Clone)]
pub struct OpenDowngradeArgs {
    /// Open stateid to downgrade
    pub stateid: StateId,
    /// Remaining access bits
    pub access: ShareAccess,
    /// Remaining deny bits
    pub deny: ShareDeny,
}

/// CLOSE arguments
#[derive(Debug, Clone)]
pub struct CloseArgs {
    /// Open stateid to close
    pub stateid: StateId,
}

/// How a LOCK names its owner
#[derive(Debug, Clone)]
pub enum LockerArgs {
    /// First lock by a new lock-owner
    NewOwner {
        /// v4.0 clientid of the lock-owner
        clientid: Option<u64>,
        /// Antecedent open stateid
        open_stateid: StateId,
        /// OPEN-side owner seqid
        open_seqid: u32,
        /// New lock stateid seqid; must be zero
        lock_seqid: u32,
        /// Lock-owner opaque bytes
        owner: Bytes,
    },
    /// Subsequent lock under an existing lock stateid
    Existing {
        /// Prior lock stateid
        stateid: StateId,
        /// Owner seqid
        seqid: u32,
    },
}

/// LOCK arguments
#[derive(Debug, Clone)]
pub struct LockArgs {
    /// Wire lock type
    pub lock_type: LockType,
    /// Whether this reclaims a pre-restart lock
    pub reclaim: bool,
    /// Range start
    pub offset: u64,
    /// Range length (EOF sentinel allowed)
    pub length: u64,
    /// Owner designation
    pub locker: LockerArgs,
}

/// LOCKT arguments
#[derive(Debug, Clone)]
pub struct LockTArgs {
    /// v4.0 clientid of the would-be owner
    pub clientid: Option<u64>,
    /// Would-be owner bytes
    pub owner: Bytes,
    /// Wire lock type
    pub lock_type: LockType,
    /// Range start
    pub offset: u64,
    /// Range length
    pub length: u64,
}

/// LOCKU arguments
#[derive(Debug, Clone)]
pub struct LockUArgs {
    /// Lock stateid
    pub stateid: StateId,
    /// Owner seqid
    pub seqid: u32,
    /// Range start
    pub offset: u64,
    /// Range length
    pub length: u64,
}

/// A parsed stateful operation
#[derive(Debug, Clone)]
pub enum OpArgs {
    /// SETCLIENTID
    SetClientId(SetClientIdArgs),
    /// SETCLIENTID_CONFIRM
    SetClientIdConfirm(SetClientIdConfirmArgs),
    /// EXCHANGE_ID
    ExchangeId(ExchangeIdArgs),
    /// CREATE_SESSION
    CreateSession(CreateSessionArgs),
    /// DESTROY_SESSION
    DestroySession {
        /// Session to destroy
        session: SessionId,
    },
    /// SEQUENCE
    Sequence(SequenceArgs),
    /// RECLAIM_COMPLETE
    ReclaimComplete,
    /// PUTFH
    PutFh {
        /// Handle becoming current
        handle: quay_state::FileHandle,
    },
    /// OPEN
    Open(OpenArgs),
    /// OPEN_DOWNGRADE
    OpenDowngrade(OpenDowngradeArgs),
    /// CLOSE
    Close(CloseArgs),
    /// LOCK
    Lock(LockArgs),
    /// LOCKT
    LockT(LockTArgs),
    /// LOCKU
    LockU(LockUArgs),
    /// RELEASE_LOCKOWNER
    ReleaseLockOwner {
        /// v4.0 clientid of the owner
        clientid: u64,
        /// Lock-owner bytes
        owner: Bytes,
    },
    /// RENEW
    Renew {
        /// Clientid renewing its lease
        clientid: u64,
    },
    /// DELEGRETURN
    DelegReturn {
        /// Delegation stateid being returned
        stateid: StateId,
    },
}

impl OpArgs {
    /// Wire opcode of this operation
    pub fn code(&self) -> OpCode {
        match self {
            OpArgs::SetClientId(_) => OpCode::SetClientId,
            OpArgs::SetClientIdConfirm(_) => OpCode::SetClientIdConfirm,
            OpArgs::ExchangeId(_) => OpCode::ExchangeId,
            OpArgs::CreateSession(_) => OpCode::CreateSession,
            OpArgs::DestroySession { .. } => OpCode::DestroySession,
            OpArgs::Sequence(_) => OpCode::Sequence,
            OpArgs::ReclaimComplete => OpCode::ReclaimComplete,
            OpArgs::PutFh { .. } => OpCode::PutFh,
            OpArgs::Open(_) => OpCode::Open,
            OpArgs::OpenDowngrade(_) => OpCode::OpenDowngrade,
            OpArgs::Close(_) => OpCode::Close,
            OpArgs::Lock(_) => OpCode::Lock,
            OpArgs::LockT(_) => OpCode::LockT,
            OpArgs::LockU(_) => OpCode::LockU,
            OpArgs::ReleaseLockOwner { .. } => OpCode::ReleaseLockOwner,
            OpArgs::Renew { .. } => OpCode::Renew,
            OpArgs::DelegReturn { .. } => OpCode::DelegReturn,
        }
    }
}

/// Operation result payload
#[derive(Debug, Clone)]
pub enum OpBody {
    /// SETCLIENTID result
    SetClientId {
        /// Issued clientid
        clientid: u64,
        /// Verifier to present at SETCLIENTID_CONFIRM
        confirm: Verifier,
    },
    /// SETCLIENTID_CONFIRM succeeded
    Confirmed,
    /// EXCHANGE_ID result
    ExchangeId {
        /// Issued (or re-presented) clientid
        clientid: u64,
        /// Expected CREATE_SESSION sequence
        sequenceid: u32,
    },
    /// CREATE_SESSION result
    CreateSession(CreateSessionReply),
    /// DESTROY_SESSION succeeded
    DestroyedSession,
    /// SEQUENCE result
    Sequence {
        /// Session id echoed
        session: SessionId,
        /// Sequence id echoed
        seqid: u32,
        /// Slot echoed
        slot: u32,
        /// Highest slot the server will accept
        highest_slot: u32,
    },
    /// Answered from the duplicate-request cache
    Replayed,
    /// RECLAIM_COMPLETE succeeded
    ReclaimComplete,
    /// PUTFH succeeded
    PutFh,
    /// OPEN result
    Open {
        /// Granted open stateid
        stateid: StateId,
    },
    /// OPEN_DOWNGRADE result
    Downgraded {
        /// Open stateid at its new generation
        stateid: StateId,
    },
    /// CLOSE succeeded
    Closed,
    /// LOCK result
    Lock {
        /// Granted lock stateid
        stateid: StateId,
    },
    /// LOCKT found no conflict
    LockTested,
    /// LOCKU result
    Unlocked {
        /// Lock stateid at its new generation
        stateid: StateId,
    },
    /// RELEASE_LOCKOWNER succeeded
    ReleasedLockOwner,
    /// RENEW succeeded
    Renewed,
    /// DELEGRETURN succeeded
    DelegReturned,
}

/// One operation's outcome inside a compound reply
#[derive(Debug, Clone)]
pub struct OpResult {
    /// Which operation ran
    pub op: OpCode,
    /// Its status
    pub status: NfsStatus,
    /// Payload on success
    pub body: Option<OpBody>,
    /// Conflicting lock details when status is `Denied`
    pub denied: Option<ConflictingLock>,
}

impl OpResult {
    /// Successful result
    pub fn ok(op: OpCode, body: OpBody) -> Self {
        Self {
            op,
            status: NfsStatus::Ok,
            body: Some(body),
            denied: None,
        }
    }

    /// Failed result
    pub fn error(op: OpCode, status: NfsStatus) -> Self {
        Self {
            op,
            status,
            body: None,
            denied: None,
        }
    }
}

/// Execute one operation against the service
pub fn dispatch(
    service: &Arc<StateService>,
    ctx: &mut CompoundContext,
    args: &OpArgs,
) -> OpResult {
    let code = args.code();
    let outcome = match args {
        OpArgs::SetClientId(a) => set_client_id(service, a),
        OpArgs::SetClientIdConfirm(a) => set_client_id_confirm(service, ctx, a),
        OpArgs::ExchangeId(a) => exchange_id(service, a),
        OpArgs::CreateSession(a) => create_session(service, a),
        OpArgs::DestroySession { session } => destroy_session(service, session),
        OpArgs::Sequence(a) => sequence(service, ctx, a),
        OpArgs::ReclaimComplete => reclaim_complete(service, ctx),
        OpArgs::PutFh { handle } => {
            ctx.current_fh = Some(handle.clone());
            Ok(OpBody::PutFh)
        }
        OpArgs::Open(a) => open(service, ctx, a),
        OpArgs::OpenDowngrade(a) => open_downgrade(service, ctx, a),
        OpArgs::Close(a) => close(service, ctx, a),
        OpArgs::Lock(a) => lock(service, ctx, a),
        OpArgs::LockT(a) => lock_test(service, ctx, a),
        OpArgs::LockU(a) => unlock(service, ctx, a),
        OpArgs::ReleaseLockOwner { clientid, owner } => {
            release_lockowner(service, *clientid, owner)
        }
        OpArgs::Renew { clientid } => renew(service, *clientid),
        OpArgs::DelegReturn { stateid } => deleg_return(service, ctx, stateid),
    };

    match outcome {
        Ok(body) => OpResult::ok(code, body),
        Err(err) => {
            let denied = match err {
                NfsError::State(StateError::Denied(ref conflict)) => Some(conflict.clone()),
                _ => None,
            };
            debug!(op = ?code, status = %err.status(), "operation failed");
            OpResult {
                op: code,
                status: err.status(),
                body: None,
                denied,
            }
        }
    }
}

fn set_client_id(service: &StateService, args: &SetClientIdArgs) -> NfsResult<OpBody> {
    let record = service.clients.register(
        args.principal.clone(),
        args.verifier,
        args.callback.clone(),
    );
    Ok(OpBody::SetClientId {
        clientid: record.id.value(),
        confirm: record.verifier,
    })
}

fn set_client_id_confirm(
    service: &StateService,
    ctx: &mut CompoundContext,
    args: &SetClientIdConfirmArgs,
) -> NfsResult<OpBody> {
    let (record, displaced) = service.clients.confirm(
        ClientId::new(args.clientid),
        args.verifier,
        &args.principal,
        &service.states,
        &service.owners,
        service.ledger().as_ref(),
    )?;
    service.finish_confirmation(&record, displaced);
    ctx.client = Some(record);
    Ok(OpBody::Confirmed)
}

fn exchange_id(service: &StateService, args: &ExchangeIdArgs) -> NfsResult<OpBody> {
    // same principal, same verifier: answer with the confirmed id instead of
    // minting a new one
    if let Some(existing) = service.clients.find_confirmed(&args.principal) {
        if existing.verifier == args.verifier {
            existing.renew_lease();
            return Ok(OpBody::ExchangeId {
                clientid: existing.id.value(),
                sequenceid: existing
                    .create_session_seq
                    .load(std::sync::atomic::Ordering::SeqCst),
            });
        }
    }
    let record = service
        .clients
        .register(args.principal.clone(), args.verifier, CallbackInfo::default());
    Ok(OpBody::ExchangeId {
        clientid: record.id.value(),
        sequenceid: record
            .create_session_seq
            .load(std::sync::atomic::Ordering::SeqCst),
    })
}

fn create_session(service: &StateService, args: &CreateSessionArgs) -> NfsResult<OpBody> {
    let id = ClientId::new(args.clientid);
    let record = service
        .clients
        .lookup(id, Want::Confirmed)
        .or_else(|_| service.clients.lookup(id, Want::Unconfirmed))?;

    // CREATE_SESSION confirms a v4.1 client implicitly
    if record.confirm_state() == ConfirmState::Unconfirmed {
        let (confirmed, displaced) = service.clients.confirm(
            record.id,
            record.verifier,
            &record.principal,
            &service.states,
            &service.owners,
            service.ledger().as_ref(),
        )?;
        service.finish_confirmation(&confirmed, displaced);
    }
    record.renew_lease();

    let reply = service
        .sessions
        .create_session(&record, args.seq, args.fore_channel.clone())?;
    Ok(OpBody::CreateSession(reply))
}

fn destroy_session(service: &StateService, session: &SessionId) -> NfsResult<OpBody> {
    service.sessions.destroy(session)?;
    Ok(OpBody::DestroyedSession)
}

fn sequence(
    service: &StateService,
    ctx: &mut CompoundContext,
    args: &SequenceArgs,
) -> NfsResult<OpBody> {
    let session = service.sessions.get(&args.session)?;
    match session.sequence_check(args.slot, args.seqid)? {
        SequenceDisposition::Proceed => {
            let record = match service.clients.lookup(session.client, Want::Confirmed) {
                Ok(record) => record,
                Err(err) => {
                    // the slot was acquired; park the failure in it so the
                    // slot does not stay busy forever
                    let _ = session.complete(
                        args.slot,
                        crate::session::CachedReply {
                            seqid: args.seqid,
                            status: NfsStatus::from_state(&err),
                            body: Bytes::new(),
                        },
                    );
                    return Err(err.into());
                }
            };
            record.renew_lease();
            let highest_slot = session.slot_count().saturating_sub(1);
            ctx.client = Some(record);
            ctx.session = Some(session);
            ctx.slot = Some((args.slot, args.seqid));
            Ok(OpBody::Sequence {
                session: args.session,
                seqid: args.seqid,
                slot: args.slot,
                highest_slot,
            })
        }
        SequenceDisposition::Replay(cached) => {
            ctx.replay = Some(cached);
            Ok(OpBody::Replayed)
        }
        SequenceDisposition::Misordered => Err(StateError::SeqMisordered.into()),
    }
}

fn reclaim_complete(service: &StateService, ctx: &mut CompoundContext) -> NfsResult<OpBody> {
    let record = ctx.client.as_ref().ok_or(StateError::StaleClientId)?;
    if !record.mark_reclaim_complete() {
        return Err(StateError::CompleteAlready.into());
    }
    service.grace.note_reclaim_complete();
    Ok(OpBody::ReclaimComplete)
}

fn resolve_client(
    service: &StateService,
    ctx: &CompoundContext,
    clientid: Option<u64>,
) -> NfsResult<Arc<quay_state::ClientIdRecord>> {
    match (&ctx.client, clientid) {
        (Some(record), _) => Ok(Arc::clone(record)),
        (None, Some(id)) => Ok(service.clients.lookup(ClientId::new(id), Want::Confirmed)?),
        (None, None) => Err(StateError::StaleClientId.into()),
    }
}

/// Grace gating shared by OPEN and LOCK
///
/// Non-reclaim operations run only outside grace; reclaims only inside it,
/// and only for clients the previous incarnation knew.
fn grace_gate<'a>(
    service: &'a StateService,
    record: &quay_state::ClientIdRecord,
    reclaim: bool,
) -> NfsResult<quay_state::GraceGuard<'a>> {
    let guard = service.grace.acquire_ref(reclaim).ok_or(if reclaim {
        StateError::NoGrace
    } else {
        StateError::GraceActive
    })?;
    if reclaim
        && !record.may_reclaim()
        && !service.grace.client_reclaimable(&record.recovery_tag)
    {
        return Err(StateError::ReclaimBad.into());
    }
    Ok(guard)
}

fn open(service: &StateService, ctx: &mut CompoundContext, args: &OpenArgs) -> NfsResult<OpBody> {
    let record = resolve_client(service, ctx, args.clientid)?;
    record.renew_lease();
    let handle = ctx.require_fh().map_err(NfsError::Protocol)?.clone();
    let file = service.resolve_regular(&handle)?;

    let _guard = grace_gate(service, &record, args.reclaim)?;

    let owner = service.owners.get_or_create_open(record.id, args.owner.clone());
    let result = service.states.open(
        file,
        owner.key(),
        &service.owners,
        args.access,
        args.deny,
        1,
    );
    service.owners.release(owner);

    let stateid = result?;
    ctx.current_stateid = Some(stateid);
    Ok(OpBody::Open { stateid })
}

fn open_downgrade(
    service: &StateService,
    ctx: &mut CompoundContext,
    args: &OpenDowngradeArgs,
) -> NfsResult<OpBody> {
    let handle = ctx.require_fh().map_err(NfsError::Protocol)?.clone();
    let file = service.resolve_handle(&handle)?;
    let stateid = service
        .states
        .downgrade(file, args.stateid, args.access, args.deny)?;
    ctx.current_stateid = Some(stateid);
    Ok(OpBody::Downgraded { stateid })
}

fn close(service: &StateService, ctx: &mut CompoundContext, args: &CloseArgs) -> NfsResult<OpBody> {
    let handle = ctx.require_fh().map_err(NfsError::Protocol)?.clone();
    let file = service.resolve_handle(&handle)?;
    service.states.close(file, args.stateid, &service.owners)?;
    ctx.current_stateid = None;
    Ok(OpBody::Closed)
}

fn lock(service: &StateService, ctx: &mut CompoundContext, args: &LockArgs) -> NfsResult<OpBody> {
    let clientid = match args.locker {
        LockerArgs::NewOwner { clientid, .. } => clientid,
        LockerArgs::Existing { .. } => None,
    };
    let record = match resolve_client(service, ctx, clientid) {
        Ok(record) => Some(record),
        // an existing lock stateid authorizes itself; v4.0 compounds reach
        // here without a session-bound client
        Err(_) if matches!(args.locker, LockerArgs::Existing { .. }) => None,
        Err(err) => return Err(err),
    };
    if let Some(ref record) = record {
        record.renew_lease();
    }

    let handle = ctx.require_fh().map_err(NfsError::Protocol)?.clone();
    let file = service.resolve_regular(&handle)?;

    let gate_record = record.as_deref();
    let _guard = match gate_record {
        Some(rec) => Some(grace_gate(service, rec, args.reclaim)?),
        None => {
            // anonymous existing-stateid path still honors the grace window
            Some(
                service
                    .grace
                    .acquire_ref(args.reclaim)
                    .ok_or(if args.reclaim {
                        StateError::NoGrace
                    } else {
                        StateError::GraceActive
                    })?,
            )
        }
    };

    let range = LockRange::new(args.offset, args.length)?;
    let locker = match &args.locker {
        LockerArgs::NewOwner {
            open_stateid,
            open_seqid,
            lock_seqid,
            owner,
            ..
        } => Locker::New {
            open_stateid: *open_stateid,
            open_seqid: *open_seqid,
            lock_seqid: *lock_seqid,
            lock_owner: owner.clone(),
        },
        LockerArgs::Existing { stateid, seqid } => Locker::Existing {
            lock_stateid: *stateid,
            lock_seqid: *seqid,
        },
    };
    let request = LockRequest {
        file,
        range,
        lock_type: args.lock_type,
        locker,
        reclaim: args.reclaim,
    };

    let stateid = service.states.lock(&request, &service.owners)?;
    ctx.current_stateid = Some(stateid);
    Ok(OpBody::Lock { stateid })
}

fn lock_test(
    service: &StateService,
    ctx: &mut CompoundContext,
    args: &LockTArgs,
) -> NfsResult<OpBody> {
    let record = resolve_client(service, ctx, args.clientid)?;
    record.renew_lease();
    let handle = ctx.require_fh().map_err(NfsError::Protocol)?.clone();
    let file = service.resolve_regular(&handle)?;

    let range = LockRange::new(args.offset, args.length)?;
    let owner = OwnerKey::lock(record.id, args.owner.clone());
    service
        .states
        .test_lock(file, Some(&owner), &range, args.lock_type)?;
    Ok(OpBody::LockTested)
}

fn unlock(
    service: &StateService,
    ctx: &mut CompoundContext,
    args: &LockUArgs,
) -> NfsResult<OpBody> {
    let handle = ctx.require_fh().map_err(NfsError::Protocol)?.clone();
    let file = service.resolve_handle(&handle)?;
    let range = LockRange::new(args.offset, args.length)?;
    let stateid = service
        .states
        .unlock(file, args.stateid, args.seqid, &range, &service.owners)?;
    ctx.current_stateid = Some(stateid);
    Ok(OpBody::Unlocked { stateid })
}

fn release_lockowner(service: &StateService, clientid: u64, owner: &Bytes) -> NfsResult<OpBody> {
    let record = service
        .clients
        .lookup(ClientId::new(clientid), Want::Confirmed)?;
    record.renew_lease();
    let key = OwnerKey::lock(record.id, owner.clone());
    service.states.release_lockowner(&key)?;
    Ok(OpBody::ReleasedLockOwner)
}

fn renew(service: &StateService, clientid: u64) -> NfsResult<OpBody> {
    service.clients.renew(ClientId::new(clientid))?;
    Ok(OpBody::Renewed)
}

fn deleg_return(
    service: &StateService,
    ctx: &mut CompoundContext,
    stateid: &StateId,
) -> NfsResult<OpBody> {
    let handle = ctx.require_fh().map_err(NfsError::Protocol)?.clone();
    let file = service.resolve_handle(&handle)?;
    service
        .states
        .return_delegation(file, *stateid, &service.owners)?;
    Ok(OpBody::DelegReturned)
}
