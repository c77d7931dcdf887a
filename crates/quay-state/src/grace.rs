//! Grace-period state machine
//!
//! Grace status lives in one atomic word: an active bit, a change-requested
//! bit, and a 30-bit count of operations currently relying on the status.
//! Readers take a counted guard; a transition first publishes the
//! change-requested bit (which makes new guards fail), then waits for the
//! count to drain, then flips the active bit. No operation can observe a
//! grace state that is in the middle of changing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::filehandle::FileHandle;
use crate::recovery::{RecoveryLedger, RecoveryRecord};

const ACTIVE: u64 = 1 << 63;
const CHANGE_REQ: u64 = 1 << 62;
const REF_MASK: u64 = (1 << 30) - 1;

/// Fallback poll interval for waiters, in case a wakeup is missed
const DRAIN_POLL: Duration = Duration::from_secs(5);

/// What triggered a grace period
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraceEvent {
    /// This server instance started
    ServerStart,
    /// A cluster peer's workload moved here; while already in grace this
    /// only extends the deadline and must not reload the ledger
    Takeover {
        /// Failed node, when the cluster layer knows it
        nodeid: Option<String>,
    },
}

/// Grace configuration
#[derive(Debug, Clone)]
pub struct GraceConfig {
    /// How long the grace window lasts
    pub grace_period: Duration,
    /// Never enter grace (test rigs, ephemeral exports)
    pub graceless: bool,
    /// Whether NLM (NFSv3 locking) is enabled; NLM clients cannot announce
    /// reclaim completion, so grace can only end at the deadline
    pub nlm_enabled: bool,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(90),
            graceless: false,
            nlm_enabled: false,
        }
    }
}

/// Guard proving the grace status the holder observed is still in force
///
/// Dropping the guard releases the reference; the last guard out wakes any
/// pending transition.
pub struct GraceGuard<'a> {
    mgr: &'a GracePeriodManager,
}

impl Drop for GraceGuard<'_> {
    fn drop(&mut self) {
        let prev = self.mgr.word.fetch_sub(1, Ordering::SeqCst);
        if prev & CHANGE_REQ != 0 && prev & REF_MASK == 1 {
            self.mgr.drain.notify_all();
        }
    }
}

/// The grace-period state machine and recovery-ledger orchestrator
pub struct GracePeriodManager {
    word: AtomicU64,
    drain_lock: Mutex<()>,
    drain: Condvar,
    deadline: Mutex<Option<Instant>>,
    config: GraceConfig,
    known_clients: AtomicU32,
    reclaim_completes: AtomicU32,
    ledger: Arc<dyn RecoveryLedger>,
    records: RwLock<HashMap<String, RecoveryRecord>>,
}

impl GracePeriodManager {
    /// Create a manager over the given ledger
    pub fn new(config: GraceConfig, ledger: Arc<dyn RecoveryLedger>) -> Self {
        Self {
            word: AtomicU64::new(0),
            drain_lock: Mutex::new(()),
            drain: Condvar::new(),
            deadline: Mutex::new(None),
            config,
            known_clients: AtomicU32::new(0),
            reclaim_completes: AtomicU32::new(0),
            ledger,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Take a reference pinning the current status, if it matches
    ///
    /// Returns `None` when the status differs from `want_grace` or a change
    /// is pending — the caller must re-evaluate, never proceed on a stale
    /// assumption.
    pub fn acquire_ref(&self, want_grace: bool) -> Option<GraceGuard<'_>> {
        let mut cur = self.word.load(Ordering::SeqCst);
        loop {
            if cur & CHANGE_REQ != 0 {
                return None;
            }
            if ((cur & ACTIVE) != 0) != want_grace {
                return None;
            }
            match self
                .word
                .compare_exchange_weak(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Some(GraceGuard { mgr: self }),
                Err(now) => cur = now,
            }
        }
    }

    /// Whether grace is currently active (unpinned snapshot)
    pub fn in_grace(&self) -> bool {
        self.word.load(Ordering::SeqCst) & ACTIVE != 0
    }

    /// Begin a grace period
    ///
    /// Returns `GraceRetry` while outstanding references drain; the
    /// initiating control loop retries until the flip lands. A takeover
    /// event while already in grace extends the deadline without touching
    /// the ledger.
    pub fn start_grace(&self, event: GraceEvent) -> StateResult<()> {
        if self.config.graceless {
            self.word.fetch_and(REF_MASK, Ordering::SeqCst);
            debug!("graceless configuration, grace forced off");
            return Ok(());
        }

        let cur = self.word.load(Ordering::SeqCst);
        if cur & ACTIVE != 0 {
            if matches!(event, GraceEvent::Takeover { .. }) {
                *self.deadline.lock() = Some(Instant::now() + self.config.grace_period);
                info!("takeover while in grace, deadline extended");
            }
            return Ok(());
        }

        if cur & REF_MASK != 0 {
            self.word.fetch_or(CHANGE_REQ, Ordering::SeqCst);
            return Err(StateError::GraceRetry);
        }

        // flip only from the exact drained state we just observed
        if self
            .word
            .compare_exchange(cur, ACTIVE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StateError::GraceRetry);
        }

        *self.deadline.lock() = Some(Instant::now() + self.config.grace_period);
        let loaded = self.ledger.read_clients()?;
        self.known_clients.store(loaded.len() as u32, Ordering::SeqCst);
        self.reclaim_completes.store(0, Ordering::SeqCst);
        {
            let mut records = self.records.write();
            records.clear();
            for record in loaded {
                records.insert(record.tag.clone(), record);
            }
        }
        info!(
            known = self.known_clients.load(Ordering::SeqCst),
            period_secs = self.config.grace_period.as_secs(),
            event = ?event,
            "grace period started"
        );
        Ok(())
    }

    /// Lift grace if its exit condition holds
    ///
    /// Without NLM, grace ends when every known client has announced
    /// reclaim completion (or the deadline lapses); with NLM enabled only
    /// the deadline ends it. Returns true when this call lifted grace.
    pub fn try_lift_grace(&self) -> StateResult<bool> {
        if self.word.load(Ordering::SeqCst) & ACTIVE == 0 {
            return Ok(false);
        }

        let all_reclaimed = self.reclaim_completes.load(Ordering::SeqCst)
            >= self.known_clients.load(Ordering::SeqCst);
        let deadline_passed = match *self.deadline.lock() {
            Some(deadline) => Instant::now() >= deadline,
            None => true,
        };
        let can_lift = if self.config.nlm_enabled {
            deadline_passed
        } else {
            all_reclaimed || deadline_passed
        };
        if !can_lift {
            return Ok(false);
        }

        self.word.fetch_or(CHANGE_REQ, Ordering::SeqCst);
        self.wait_refs_drained();

        let mut cur = self.word.load(Ordering::SeqCst);
        loop {
            if cur & REF_MASK != 0 {
                self.wait_refs_drained();
                cur = self.word.load(Ordering::SeqCst);
                continue;
            }
            match self
                .word
                .compare_exchange(cur, 0, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }

        *self.deadline.lock() = None;
        self.records.write().clear();
        if let Err(err) = self.ledger.swap_generation() {
            warn!(%err, "recovery ledger finalize failed");
        }
        info!("grace period lifted");
        Ok(true)
    }

    fn wait_refs_drained(&self) {
        let mut guard = self.drain_lock.lock();
        while self.word.load(Ordering::SeqCst) & REF_MASK != 0 {
            // timed wait covers a wakeup lost between the check and the wait
            self.drain.wait_for(&mut guard, DRAIN_POLL);
        }
    }

    /// Whether `tag` belongs to a client known to the previous incarnation
    pub fn client_reclaimable(&self, tag: &str) -> bool {
        self.in_grace() && self.records.read().contains_key(tag)
    }

    /// Whether a delegation on `handle` may be reclaimed by `tag`
    ///
    /// False when the handle appears in the client's revoked set.
    pub fn check_deleg_reclaim(&self, tag: &str, handle: &FileHandle) -> bool {
        let records = self.records.read();
        match records.get(tag) {
            Some(record) => !record
                .revoked
                .iter()
                .any(|h| h.as_ref() == handle.as_bytes()),
            None => true,
        }
    }

    /// Count one client's reclaim completion
    pub fn note_reclaim_complete(&self) {
        self.reclaim_completes.fetch_add(1, Ordering::SeqCst);
    }

    /// Clients loaded from the previous incarnation
    pub fn known_client_count(&self) -> u32 {
        self.known_clients.load(Ordering::SeqCst)
    }

    /// Reclaim completions seen so far
    pub fn reclaim_complete_count(&self) -> u32 {
        self.reclaim_completes.load(Ordering::SeqCst)
    }

    /// The ledger this manager orchestrates
    pub fn ledger(&self) -> &Arc<dyn RecoveryLedger> {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::MemoryLedger;
    use bytes::Bytes;

    fn manager(config: GraceConfig) -> (GracePeriodManager, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        (GracePeriodManager::new(config, ledger.clone()), ledger)
    }

    #[test]
    fn test_start_and_observe_grace() {
        let (grace, _) = manager(GraceConfig::default());
        assert!(!grace.in_grace());

        grace.start_grace(GraceEvent::ServerStart).unwrap();
        assert!(grace.in_grace());

        assert!(grace.acquire_ref(true).is_some());
        assert!(grace.acquire_ref(false).is_none());
    }

    #[test]
    fn test_graceless_forces_off() {
        let (grace, _) = manager(GraceConfig {
            graceless: true,
            ..Default::default()
        });
        grace.start_grace(GraceEvent::ServerStart).unwrap();
        assert!(!grace.in_grace());
        assert!(grace.acquire_ref(false).is_some());
    }

    #[test]
    fn test_start_grace_retries_until_refs_drain() {
        let (grace, ledger) = manager(GraceConfig::default());
        ledger.persist_add("survivor").unwrap();

        let guard = grace.acquire_ref(false).expect("not in grace yet");
        assert_eq!(
            grace.start_grace(GraceEvent::ServerStart).unwrap_err(),
            StateError::GraceRetry
        );
        // change request pins new refs out
        assert!(grace.acquire_ref(false).is_none());

        drop(guard);
        grace.start_grace(GraceEvent::ServerStart).unwrap();
        assert!(grace.in_grace());
        // the ledger was rotated exactly once
        assert_eq!(grace.known_client_count(), 1);
        assert!(grace.client_reclaimable("survivor"));

        // a second start is a no-op, not a second rotation
        grace.start_grace(GraceEvent::ServerStart).unwrap();
        assert_eq!(grace.known_client_count(), 1);
    }

    #[test]
    fn test_lift_waits_for_reclaims() {
        let (grace, ledger) = manager(GraceConfig {
            grace_period: Duration::from_secs(3600),
            ..Default::default()
        });
        ledger.persist_add("a").unwrap();
        ledger.persist_add("b").unwrap();
        grace.start_grace(GraceEvent::ServerStart).unwrap();

        assert!(!grace.try_lift_grace().unwrap());
        grace.note_reclaim_complete();
        assert!(!grace.try_lift_grace().unwrap());
        grace.note_reclaim_complete();
        assert!(grace.try_lift_grace().unwrap());
        assert!(!grace.in_grace());

        // further lifts are no-ops
        assert!(!grace.try_lift_grace().unwrap());
    }

    #[test]
    fn test_lift_on_deadline() {
        let (grace, ledger) = manager(GraceConfig {
            grace_period: Duration::from_millis(0),
            ..Default::default()
        });
        ledger.persist_add("absent").unwrap();
        grace.start_grace(GraceEvent::ServerStart).unwrap();
        assert!(grace.try_lift_grace().unwrap());
    }

    #[test]
    fn test_nlm_holds_grace_to_deadline() {
        let (grace, _) = manager(GraceConfig {
            grace_period: Duration::from_secs(3600),
            nlm_enabled: true,
            ..Default::default()
        });
        grace.start_grace(GraceEvent::ServerStart).unwrap();
        // zero known clients would lift immediately without NLM
        assert!(!grace.try_lift_grace().unwrap());
    }

    #[test]
    fn test_takeover_extends_without_reload() {
        let (grace, ledger) = manager(GraceConfig {
            grace_period: Duration::from_secs(3600),
            ..Default::default()
        });
        ledger.persist_add("x").unwrap();
        grace.start_grace(GraceEvent::ServerStart).unwrap();
        assert_eq!(grace.known_client_count(), 1);

        // records written after the rotation belong to this incarnation and
        // must not leak into the reclaim set via a takeover
        ledger.persist_add("y").unwrap();
        grace
            .start_grace(GraceEvent::Takeover { nodeid: None })
            .unwrap();
        assert_eq!(grace.known_client_count(), 1);
        assert!(!grace.client_reclaimable("y"));
    }

    #[test]
    fn test_deleg_reclaim_filter() {
        let (grace, ledger) = manager(GraceConfig::default());
        ledger.persist_add("c").unwrap();
        ledger
            .persist_revoke("c", &Bytes::from_static(b"fh-revoked"))
            .unwrap();
        grace.start_grace(GraceEvent::ServerStart).unwrap();

        let revoked = FileHandle::new(&b"fh-revoked"[..]);
        let clean = FileHandle::new(&b"fh-clean"[..]);
        assert!(!grace.check_deleg_reclaim("c", &revoked));
        assert!(grace.check_deleg_reclaim("c", &clean));
    }
}
