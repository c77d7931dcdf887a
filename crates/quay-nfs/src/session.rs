//! NFSv4.1 session management
//!
//! Sessions give compounds exactly-once semantics. Each slot remembers the
//! last sequence id it executed and the reply it produced; a retransmission
//! presents the same sequence id and gets the cached reply back without
//! re-executing anything. CREATE_SESSION itself is guarded the same way
//! through a per-client creation sequence, kept on the client record because
//! the replay may arrive after the session it created is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use quay_state::{ClientId, ClientIdRecord};

use crate::error::{NfsError, NfsResult, NfsStatus};

/// Session ID (16 bytes, opaque)
pub type SessionId = [u8; 16];

/// Channel attributes negotiated at CREATE_SESSION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAttrs {
    /// Header padding (for RDMA)
    pub header_pad_size: u32,
    /// Maximum request size
    pub max_request_size: u32,
    /// Maximum response size
    pub max_response_size: u32,
    /// Maximum response size the server will cache
    pub max_response_size_cached: u32,
    /// Maximum operations per compound
    pub max_ops: u32,
    /// Maximum concurrent requests (slot count)
    pub max_requests: u32,
}

impl Default for ChannelAttrs {
    fn default() -> Self {
        Self {
            header_pad_size: 0,
            max_request_size: 1024 * 1024,
            max_response_size: 1024 * 1024,
            max_response_size_cached: 64 * 1024,
            max_ops: 16,
            max_requests: 16,
        }
    }
}

/// Cached reply held in a slot's duplicate-request cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedReply {
    /// Sequence id this reply answered
    pub seqid: u32,
    /// Status of the cached compound
    pub status: NfsStatus,
    /// Opaque reply body
    pub body: Bytes,
}

/// Per-slot sequence state
#[derive(Debug)]
pub struct SessionSlot {
    last_seqid: u32,
    cached: Option<CachedReply>,
    in_use: bool,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            last_seqid: 0,
            cached: None,
            in_use: false,
        }
    }
}

/// What a sequence check decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceDisposition {
    /// New request: execute it
    Proceed,
    /// Retransmission of the last request: answer from the cache
    Replay(CachedReply),
    /// Neither current nor the immediate predecessor
    Misordered,
}

/// An NFSv4.1 session
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Owning client
    pub client: ClientId,
    /// Fore channel attributes (after clamping)
    pub fore_channel: ChannelAttrs,
    /// Back channel attributes, when the client bound one
    pub back_channel: Option<ChannelAttrs>,
    /// Creation time
    pub created: Instant,
    slots: Vec<Mutex<SessionSlot>>,
}

impl Session {
    fn new(id: SessionId, client: ClientId, fore_channel: ChannelAttrs) -> Self {
        let slots = (0..fore_channel.max_requests as usize)
            .map(|_| Mutex::new(SessionSlot::new()))
            .collect();
        Self {
            id,
            client,
            fore_channel,
            back_channel: None,
            created: Instant::now(),
            slots,
        }
    }

    /// Number of slots
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Apply the per-slot replay rule
    ///
    /// `last + 1` proceeds, `last` replays the cached reply, anything else
    /// is misordered. A slot still executing its current request treats a
    /// duplicate as misordered rather than running it twice.
    pub fn sequence_check(&self, slot_id: u32, seqid: u32) -> NfsResult<SequenceDisposition> {
        let slot = self
            .slots
            .get(slot_id as usize)
            .ok_or(NfsError::Protocol(NfsStatus::BadSlot))?;
        let mut slot = slot.lock();

        if seqid == slot.last_seqid.wrapping_add(1) {
            if slot.in_use {
                return Ok(SequenceDisposition::Misordered);
            }
            slot.in_use = true;
            Ok(SequenceDisposition::Proceed)
        } else if seqid == slot.last_seqid && slot.last_seqid != 0 {
            match slot.cached.clone() {
                Some(reply) => Ok(SequenceDisposition::Replay(reply)),
                None => Ok(SequenceDisposition::Misordered),
            }
        } else {
            Ok(SequenceDisposition::Misordered)
        }
    }

    /// Record a finished request's reply in its slot
    pub fn complete(&self, slot_id: u32, reply: CachedReply) -> NfsResult<()> {
        let slot = self
            .slots
            .get(slot_id as usize)
            .ok_or(NfsError::Protocol(NfsStatus::BadSlot))?;
        let mut slot = slot.lock();
        slot.last_seqid = reply.seqid;
        slot.cached = Some(reply);
        slot.in_use = false;
        Ok(())
    }
}

/// Reply to CREATE_SESSION, cached verbatim for replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionReply {
    /// The created session's id
    pub session: SessionId,
    /// Echoed creation sequence
    pub seq: u32,
    /// Clamped fore channel attributes
    pub fore_channel: ChannelAttrs,
}

struct CreationWindow {
    expected: u32,
    reply: Option<CreateSessionReply>,
}

/// Session registry with exactly-once CREATE_SESSION
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    by_client: DashMap<ClientId, Vec<SessionId>>,
    creation: DashMap<ClientId, Mutex<CreationWindow>>,
    max_slots: u32,
    counter: AtomicU64,
}

impl SessionManager {
    /// Create a manager with a fixed server-side slot limit
    pub fn new(max_slots: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            by_client: DashMap::new(),
            creation: DashMap::new(),
            max_slots,
            counter: AtomicU64::new(1),
        }
    }

    fn next_session_id(&self, client: ClientId) -> SessionId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&client.value().to_be_bytes());
        id[8..].copy_from_slice(&n.to_be_bytes());
        id
    }

    /// Create a session with exactly-once semantics
    ///
    /// `client_seq` equal to the expected value executes, caches the reply,
    /// and advances the window; the immediately previous value returns the
    /// cached reply verbatim without re-executing; anything else is
    /// `SeqMisordered`. The requested slot count is clamped to the server's
    /// limit.
    pub fn create_session(
        &self,
        client: &Arc<ClientIdRecord>,
        client_seq: u32,
        mut fore_channel: ChannelAttrs,
    ) -> NfsResult<CreateSessionReply> {
        let window = self.creation.entry(client.id).or_insert_with(|| {
            Mutex::new(CreationWindow {
                expected: client.create_session_seq.load(Ordering::SeqCst),
                reply: None,
            })
        });
        let mut window = window.lock();

        if client_seq == window.expected.wrapping_sub(1) {
            if let Some(ref reply) = window.reply {
                debug!(clientid = client.id.value(), "create_session replay");
                return Ok(reply.clone());
            }
            return Err(NfsError::from(quay_state::StateError::SeqMisordered));
        }
        if client_seq != window.expected {
            return Err(NfsError::from(quay_state::StateError::SeqMisordered));
        }

        fore_channel.max_requests = fore_channel.max_requests.min(self.max_slots).max(1);
        let id = self.next_session_id(client.id);
        let session = Arc::new(Session::new(id, client.id, fore_channel.clone()));
        self.sessions.insert(id, session);
        self.by_client.entry(client.id).or_default().push(id);

        let reply = CreateSessionReply {
            session: id,
            seq: client_seq,
            fore_channel,
        };
        window.reply = Some(reply.clone());
        window.expected = window.expected.wrapping_add(1);
        client
            .create_session_seq
            .store(window.expected, Ordering::SeqCst);

        info!(clientid = client.id.value(), "session created");
        Ok(reply)
    }

    /// Look up a session
    pub fn get(&self, id: &SessionId) -> NfsResult<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|s| Arc::clone(&s))
            .ok_or(NfsError::from(quay_state::StateError::BadSession))
    }

    /// Destroy a session
    pub fn destroy(&self, id: &SessionId) -> NfsResult<()> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or(NfsError::from(quay_state::StateError::BadSession))?;
        if let Some(mut ids) = self.by_client.get_mut(&session.client) {
            ids.retain(|s| s != id);
        }
        info!(clientid = session.client.value(), "session destroyed");
        Ok(())
    }

    /// Destroy every session a client owns (client expiry)
    pub fn destroy_client_sessions(&self, client: ClientId) -> usize {
        let ids = self
            .by_client
            .remove(&client)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        for id in &ids {
            self.sessions.remove(id);
        }
        self.creation.remove(&client);
        ids.len()
    }

    /// Sessions a client currently owns
    pub fn client_sessions(&self, client: ClientId) -> Vec<SessionId> {
        self.by_client
            .get(&client)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions exist
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quay_state::{CallbackInfo, ClientRegistry, Principal, Verifier};
    use std::time::Duration;

    fn client() -> (ClientRegistry, Arc<ClientIdRecord>) {
        let registry = ClientRegistry::new(1, Duration::from_secs(90));
        let record = registry.register(
            Principal {
                owner: Bytes::from_static(b"c1"),
                addr: "10.0.0.1:700".parse().unwrap(),
            },
            Verifier([0; 8]),
            CallbackInfo::default(),
        );
        (registry, record)
    }

    #[test]
    fn test_create_session_executes_once() {
        let (_reg, record) = client();
        let mgr = SessionManager::new(16);

        let first = mgr
            .create_session(&record, 1, ChannelAttrs::default())
            .unwrap();
        assert_eq!(mgr.len(), 1);

        // replay with the previous sequence returns the identical reply
        // without creating a second session
        let replay = mgr
            .create_session(&record, 1, ChannelAttrs::default())
            .unwrap();
        assert_eq!(first, replay);
        assert_eq!(mgr.len(), 1);

        // the next sequence creates a new session
        let second = mgr
            .create_session(&record, 2, ChannelAttrs::default())
            .unwrap();
        assert_ne!(first.session, second.session);
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_create_session_misordered() {
        let (_reg, record) = client();
        let mgr = SessionManager::new(16);

        let err = mgr
            .create_session(&record, 5, ChannelAttrs::default())
            .unwrap_err();
        assert_eq!(err.status(), NfsStatus::SeqMisordered);
    }

    #[test]
    fn test_slot_clamp() {
        let (_reg, record) = client();
        let mgr = SessionManager::new(8);

        let reply = mgr
            .create_session(
                &record,
                1,
                ChannelAttrs {
                    max_requests: 1024,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(reply.fore_channel.max_requests, 8);

        let session = mgr.get(&reply.session).unwrap();
        assert_eq!(session.slot_count(), 8);
    }

    #[test]
    fn test_slot_sequence_replay() {
        let (_reg, record) = client();
        let mgr = SessionManager::new(4);
        let reply = mgr
            .create_session(&record, 1, ChannelAttrs::default())
            .unwrap();
        let session = mgr.get(&reply.session).unwrap();

        assert_eq!(
            session.sequence_check(0, 1).unwrap(),
            SequenceDisposition::Proceed
        );
        session
            .complete(
                0,
                CachedReply {
                    seqid: 1,
                    status: NfsStatus::Ok,
                    body: Bytes::from_static(b"answer"),
                },
            )
            .unwrap();

        match session.sequence_check(0, 1).unwrap() {
            SequenceDisposition::Replay(cached) => {
                assert_eq!(cached.body, Bytes::from_static(b"answer"));
            }
            other => panic!("expected replay, got {other:?}"),
        }

        assert_eq!(
            session.sequence_check(0, 2).unwrap(),
            SequenceDisposition::Proceed
        );
        assert_eq!(
            session.sequence_check(0, 7).unwrap(),
            SequenceDisposition::Misordered
        );
    }

    #[test]
    fn test_bad_slot() {
        let (_reg, record) = client();
        let mgr = SessionManager::new(2);
        let reply = mgr
            .create_session(&record, 1, ChannelAttrs::default())
            .unwrap();
        let session = mgr.get(&reply.session).unwrap();

        let err = session.sequence_check(99, 1).unwrap_err();
        assert_eq!(err.status(), NfsStatus::BadSlot);
    }

    #[test]
    fn test_destroy_client_sessions() {
        let (_reg, record) = client();
        let mgr = SessionManager::new(4);
        mgr.create_session(&record, 1, ChannelAttrs::default())
            .unwrap();
        mgr.create_session(&record, 2, ChannelAttrs::default())
            .unwrap();

        assert_eq!(mgr.destroy_client_sessions(record.id), 2);
        assert!(mgr.is_empty());
        assert!(mgr.client_sessions(record.id).is_empty());
    }
}
