//! NLM (NFSv3 locking) client and owner caches
//!
//! The NLM side of the house mirrors the v4 registries: an `NsmClient` is
//! the monitored-host identity, an `NlmClient` binds it to a transport, and
//! an `NlmOwner` is the per-process lock holder beneath it. Each level is
//! interned through [`RefCountedStore`] and holds a reference on its parent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::StateResult;
use crate::store::{Handle, RefCountedStore};

/// Transport an NLM client spoke over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

/// How much work a cache lookup is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Care {
    /// Create if missing, do not monitor
    No,
    /// Create if missing, explicitly without host monitoring
    NoMonitor,
    /// Create if missing and register host monitoring
    Monitor,
}

/// Host-monitoring callback (NSM / rpc.statd integration)
///
/// Registration failure on the `Monitor` care level aborts the lookup and
/// releases the freshly interned entry.
pub trait NsmMonitor: Send + Sync {
    /// Start monitoring a host
    fn monitor(&self, caller_name: &str) -> StateResult<()>;

    /// Stop monitoring a host
    fn unmonitor(&self, caller_name: &str) -> StateResult<()>;
}

/// Monitor that accepts everything; standalone and test deployments
pub struct NoopMonitor;

impl NsmMonitor for NoopMonitor {
    fn monitor(&self, _caller_name: &str) -> StateResult<()> {
        Ok(())
    }

    fn unmonitor(&self, _caller_name: &str) -> StateResult<()> {
        Ok(())
    }
}

/// Monitored-host identity
#[derive(Debug)]
pub struct NsmClient {
    /// Host name as the client reported it
    pub caller_name: String,
    monitored: AtomicBool,
}

impl NsmClient {
    /// Whether host monitoring is registered
    pub fn is_monitored(&self) -> bool {
        self.monitored.load(Ordering::SeqCst)
    }
}

/// Key of a transport-bound NLM client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NlmClientKey {
    /// Host name
    pub caller_name: String,
    /// Transport the client spoke over
    pub transport: TransportKind,
}

/// Transport-bound NLM client
pub struct NlmClient {
    nsm_key: String,
}

/// Key of an NLM lock owner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NlmOwnerKey {
    /// The owning client
    pub client: NlmClientKey,
    /// Client-side process id (svid)
    pub svid: i32,
    /// Opaque owner handle bytes
    pub handle: Bytes,
}

/// NLM lock owner
pub struct NlmOwner;

/// Counted reference to an NSM client
pub type NsmClientHandle = Handle<String, NsmClient>;
/// Counted reference to an NLM client
pub type NlmClientHandle = Handle<NlmClientKey, NlmClient>;
/// Counted reference to an NLM owner
pub type NlmOwnerHandle = Handle<NlmOwnerKey, NlmOwner>;

/// The three-level NLM interning cache
pub struct NlmClientOwnerCache {
    nsm_clients: RefCountedStore<String, NsmClient>,
    clients: RefCountedStore<NlmClientKey, NlmClient>,
    owners: RefCountedStore<NlmOwnerKey, NlmOwner>,
    monitor: Arc<dyn NsmMonitor>,
}

impl NlmClientOwnerCache {
    /// Create a cache using `monitor` for host monitoring
    pub fn new(monitor: Arc<dyn NsmMonitor>) -> Self {
        Self {
            nsm_clients: RefCountedStore::new(),
            clients: RefCountedStore::new(),
            owners: RefCountedStore::new(),
            monitor,
        }
    }

    /// Intern a monitored-host identity
    ///
    /// With `Care::Monitor`, a host not yet monitored is registered with the
    /// NSM callback; if registration fails the entry (fresh or not) loses
    /// the reference just taken, collapsing a fresh entry back out of the
    /// cache.
    pub fn get_nsm_client(&self, care: Care, caller_name: &str) -> StateResult<NsmClientHandle> {
        let handle = self.nsm_clients.get_or_create(caller_name.to_string(), || {
            debug!(caller_name, "interned nsm client");
            NsmClient {
                caller_name: caller_name.to_string(),
                monitored: AtomicBool::new(false),
            }
        });

        if care == Care::Monitor && !handle.is_monitored() {
            if let Err(err) = self.monitor.monitor(caller_name) {
                warn!(caller_name, %err, "host monitoring registration failed");
                self.nsm_clients.release(handle);
                return Err(err);
            }
            handle.monitored.store(true, Ordering::SeqCst);
        }
        Ok(handle)
    }

    /// Intern a transport-bound NLM client beneath its NSM identity
    pub fn get_nlm_client(
        &self,
        care: Care,
        caller_name: &str,
        transport: TransportKind,
    ) -> StateResult<NlmClientHandle> {
        let nsm = self.get_nsm_client(care, caller_name)?;
        let key = NlmClientKey {
            caller_name: caller_name.to_string(),
            transport,
        };
        let mut created = false;
        let handle = self.clients.get_or_create(key, || {
            created = true;
            NlmClient {
                nsm_key: caller_name.to_string(),
            }
        });
        if !created {
            // a fresh client keeps the nsm reference taken above
            self.nsm_clients.release(nsm);
        }
        Ok(handle)
    }

    /// Intern an NLM owner beneath its client
    pub fn get_nlm_owner(
        &self,
        client: &NlmClientHandle,
        svid: i32,
        handle_bytes: Bytes,
    ) -> StateResult<NlmOwnerHandle> {
        let key = NlmOwnerKey {
            client: client.key().clone(),
            svid,
            handle: handle_bytes,
        };
        let mut created = false;
        let owner = self.owners.get_or_create(key, || {
            created = true;
            NlmOwner
        });
        if created {
            self.clients.retain(client.key());
        }
        Ok(owner)
    }

    /// Look up an owner without creating
    pub fn find_nlm_owner(&self, key: &NlmOwnerKey) -> Option<NlmOwnerHandle> {
        self.owners.get(key)
    }

    /// Drop an owner reference, cascading to its client and NSM identity
    pub fn release_owner(&self, handle: NlmOwnerHandle) {
        let client_key = handle.key().client.clone();
        if self.owners.release(handle) {
            self.release_client_key(&client_key);
        }
    }

    /// Drop a client reference, cascading to its NSM identity
    pub fn release_client(&self, handle: NlmClientHandle) {
        let nsm_key = handle.nsm_key.clone();
        if self.clients.release(handle) {
            self.release_nsm_key(&nsm_key);
        }
    }

    fn release_client_key(&self, key: &NlmClientKey) {
        let nsm_key = key.caller_name.clone();
        if self.clients.release_key(key) {
            self.release_nsm_key(&nsm_key);
        }
    }

    /// Drop an NSM reference, unmonitoring on the way out
    pub fn release_nsm_client(&self, handle: NsmClientHandle) {
        let caller = handle.caller_name.clone();
        let was_monitored = handle.is_monitored();
        if self.nsm_clients.release(handle) {
            self.finish_nsm_removal(&caller, was_monitored);
        }
    }

    fn release_nsm_key(&self, key: &String) {
        let was_monitored = self
            .nsm_clients
            .get(key)
            .map(|h| {
                let m = h.is_monitored();
                self.nsm_clients.release(h);
                m
            })
            .unwrap_or(false);
        if self.nsm_clients.release_key(key) {
            self.finish_nsm_removal(key, was_monitored);
        }
    }

    fn finish_nsm_removal(&self, caller_name: &str, was_monitored: bool) {
        if was_monitored {
            if let Err(err) = self.monitor.unmonitor(caller_name) {
                warn!(caller_name, %err, "host unmonitor failed");
            }
        }
        debug!(caller_name, "nsm client destroyed");
    }

    /// Live NSM identities
    pub fn nsm_count(&self) -> usize {
        self.nsm_clients.len()
    }

    /// Live NLM clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Live NLM owners
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }
}
