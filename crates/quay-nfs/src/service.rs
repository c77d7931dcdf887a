//! The state service: one explicit owner for every registry
//!
//! Nothing in this crate lives in a file-scope static. [`StateService`]
//! owns the client registry, owner and state stores, session manager, grace
//! machinery, and the NLM caches, and is passed by reference to every
//! operation handler. It also runs the background reaper that expires lapsed
//! leases and lifts grace when its exit condition holds.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use quay_state::{
    ClientIdRecord, ClientRegistry, ClusterHooks, DirLedger, FileHandle, FileId,
    FileIdentityProvider, FileKind, GraceConfig, GraceEvent, GracePeriodManager, LocalNode,
    LockRequest, MapIdentityProvider, MemoryLedger, NlmClientOwnerCache, NoopMonitor, NsmMonitor,
    OwnerStore, RecoveryLedger, StateError, StateId, StateResult, StateStore,
};

use crate::config::NfsConfig;
use crate::error::NfsResult;
use crate::session::SessionManager;

/// The stateful core of the NFS service
pub struct StateService {
    config: NfsConfig,
    /// Client identity lifecycle
    pub clients: ClientRegistry,
    /// Open/lock owner interning
    pub owners: OwnerStore,
    /// Stateid-named state
    pub states: StateStore,
    /// NFSv4.1 sessions
    pub sessions: SessionManager,
    /// Grace-period machinery
    pub grace: GracePeriodManager,
    /// NLM client/owner caches
    pub nlm: NlmClientOwnerCache,
    ledger: Arc<dyn RecoveryLedger>,
    identity: Arc<dyn FileIdentityProvider>,
    hooks: Arc<dyn ClusterHooks>,
    shutdown: watch::Sender<bool>,
}

/// Builder wiring pluggable collaborators into a [`StateService`]
pub struct StateServiceBuilder {
    config: NfsConfig,
    ledger: Option<Arc<dyn RecoveryLedger>>,
    identity: Option<Arc<dyn FileIdentityProvider>>,
    hooks: Option<Arc<dyn ClusterHooks>>,
    monitor: Option<Arc<dyn NsmMonitor>>,
}

impl StateServiceBuilder {
    /// Use a specific recovery ledger
    pub fn ledger(mut self, ledger: Arc<dyn RecoveryLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Use a specific file-identity provider
    pub fn identity(mut self, identity: Arc<dyn FileIdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Use cluster coordination hooks
    pub fn hooks(mut self, hooks: Arc<dyn ClusterHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Use an NSM host-monitoring backend
    pub fn monitor(mut self, monitor: Arc<dyn NsmMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Build the service
    pub fn build(self) -> NfsResult<Arc<StateService>> {
        let config = self.config;
        let epoch = boot_epoch();

        let ledger: Arc<dyn RecoveryLedger> = match self.ledger {
            Some(ledger) => ledger,
            None => match config.recovery_root {
                Some(ref root) => Arc::new(DirLedger::new(root.clone())?),
                None => Arc::new(MemoryLedger::new()),
            },
        };
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(MapIdentityProvider::new()));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(LocalNode));
        let monitor = self.monitor.unwrap_or_else(|| Arc::new(NoopMonitor));

        let grace = GracePeriodManager::new(
            GraceConfig {
                grace_period: config.grace_period,
                graceless: config.graceless,
                nlm_enabled: config.nlm_enabled,
            },
            Arc::clone(&ledger),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(StateService {
            clients: ClientRegistry::new(epoch, config.lease_time),
            owners: OwnerStore::new(),
            states: StateStore::new(epoch),
            sessions: SessionManager::new(config.max_session_slots),
            grace,
            nlm: NlmClientOwnerCache::new(monitor),
            ledger,
            identity,
            hooks,
            shutdown,
            config,
        }))
    }
}

fn boot_epoch() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
}

impl StateService {
    /// Start building a service
    pub fn builder(config: NfsConfig) -> StateServiceBuilder {
        StateServiceBuilder {
            config,
            ledger: None,
            identity: None,
            hooks: None,
            monitor: None,
        }
    }

    /// Build a service with default collaborators
    pub fn new(config: NfsConfig) -> NfsResult<Arc<Self>> {
        Self::builder(config).build()
    }

    /// The configuration the service was built with
    pub fn config(&self) -> &NfsConfig {
        &self.config
    }

    /// The recovery ledger in use
    pub fn ledger(&self) -> &Arc<dyn RecoveryLedger> {
        &self.ledger
    }

    /// The cluster hooks in use
    pub fn hooks(&self) -> &Arc<dyn ClusterHooks> {
        &self.hooks
    }

    /// Resolve a filehandle to its file identity
    pub fn resolve_handle(&self, handle: &FileHandle) -> StateResult<FileId> {
        self.identity.file_identity(handle)
    }

    /// Resolve a filehandle and require a regular file
    pub fn resolve_regular(&self, handle: &FileHandle) -> StateResult<FileId> {
        let file = self.identity.file_identity(handle)?;
        match self.identity.file_kind(file)? {
            FileKind::Regular => Ok(file),
            _ => Err(StateError::Inval),
        }
    }

    /// Enter grace, retrying internally while outstanding refs drain
    ///
    /// `GraceRetry` never escapes this loop; callers either see success or a
    /// real failure from the ledger.
    pub async fn begin_grace(&self, event: GraceEvent) -> NfsResult<()> {
        loop {
            match self.grace.start_grace(event.clone()) {
                Ok(()) => return Ok(()),
                Err(StateError::GraceRetry) => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Mark a freshly confirmed client reclaim-eligible if the previous
    /// incarnation knew it, and drop the displaced client's sessions
    pub fn finish_confirmation(
        &self,
        record: &Arc<ClientIdRecord>,
        displaced: Option<quay_state::ClientId>,
    ) {
        if let Some(old) = displaced {
            self.sessions.destroy_client_sessions(old);
        }
        if self.grace.client_reclaimable(&record.recovery_tag) {
            record.set_may_reclaim(true);
        }
    }

    /// Submit an NLM lock for asynchronous grant
    ///
    /// NLM's blocking-lock callbacks resolve out of band; the request runs
    /// on the runtime and the result arrives on the returned channel for the
    /// response path to pick up.
    pub fn submit_nlm_lock(
        self: &Arc<Self>,
        request: LockRequest,
    ) -> oneshot::Receiver<StateResult<StateId>> {
        let (tx, rx) = oneshot::channel();
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service.states.lock(&request, &service.owners);
            let _ = tx.send(result);
        });
        rx
    }

    /// One reaper pass: expire lapsed leases, poll grace exit, let the
    /// cluster layer nudge grace
    pub fn reap(&self) {
        for clientid in self.clients.expired_clients() {
            info!(clientid = clientid.value(), "lease lapsed, expiring client");
            self.sessions.destroy_client_sessions(clientid);
            if let Err(err) = self.clients.expire(
                clientid,
                false,
                &self.states,
                &self.owners,
                self.ledger.as_ref(),
            ) {
                warn!(clientid = clientid.value(), %err, "client expiry failed");
            }
        }
        if let Err(err) = self.grace.try_lift_grace() {
            warn!(%err, "grace lift attempt failed");
        }
        self.hooks.maybe_start_grace();
    }

    /// Start the background reaper
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => service.reap(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("state service reaper stopped");
        })
    }

    /// Stop the background reaper
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_service() -> (Arc<StateService>, Arc<MapIdentityProvider>) {
        let provider = Arc::new(MapIdentityProvider::new());
        let service = StateService::builder(NfsConfig::default())
            .identity(provider.clone())
            .build()
            .unwrap();
        (service, provider)
    }

    #[test]
    fn test_resolve_regular_rejects_directories() {
        let (service, provider) = provider_service();
        let file = FileHandle::new(&b"f"[..]);
        let dir = FileHandle::new(&b"d"[..]);
        provider.register(file.clone(), FileKind::Regular);
        provider.register(dir.clone(), FileKind::Directory);

        assert!(service.resolve_regular(&file).is_ok());
        assert_eq!(service.resolve_regular(&dir), Err(StateError::Inval));
    }

    #[tokio::test]
    async fn test_begin_grace_retries_internally() {
        let (service, _) = provider_service();
        // a holder of the not-in-grace status forces one retry round
        let guard = service.grace.acquire_ref(false).unwrap();
        let waiter = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.begin_grace(GraceEvent::ServerStart).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap().unwrap();
        assert!(service.grace.in_grace());
    }

    #[tokio::test]
    async fn test_reaper_start_and_shutdown() {
        let (service, _) = provider_service();
        let handle = service.start();
        service.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_async_nlm_lock_resolves() {
        let provider = Arc::new(MapIdentityProvider::new());
        let service = StateService::builder(NfsConfig::default().with_nlm())
            .identity(provider.clone())
            .build()
            .unwrap();
        let fh = FileHandle::new(&b"nlm"[..]);
        let file = provider.register(fh, FileKind::Regular);

        let owner = service.owners.get_or_create_open(
            quay_state::ClientId::new(9),
            bytes::Bytes::from_static(b"oo"),
        );
        let open = service
            .states
            .open(
                file,
                owner.key(),
                &service.owners,
                quay_state::ShareAccess::BOTH,
                quay_state::ShareDeny::NONE,
                1,
            )
            .unwrap();

        let rx = service.submit_nlm_lock(LockRequest {
            file,
            range: quay_state::LockRange::new(0, 100).unwrap(),
            lock_type: quay_state::LockType::WriteLt,
            locker: quay_state::Locker::New {
                open_stateid: open,
                open_seqid: 1,
                lock_seqid: 0,
                lock_owner: bytes::Bytes::from_static(b"nlm-owner"),
            },
            reclaim: false,
        });
        let granted = rx.await.unwrap().unwrap();
        assert_eq!(granted.seqid, 1);
        service.owners.release(owner);
    }
}
