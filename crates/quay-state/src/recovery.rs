//! Recovery-record persistence and cluster coordination hooks
//!
//! Each client that may reclaim state after a restart leaves a record keyed
//! by its recovery tag. Records live in two generations: the set written by
//! the current incarnation, and the set inherited from the previous one,
//! which is what reclaim eligibility is judged against during grace.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};

/// One client's recovery state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRecord {
    /// Recovery tag identifying the client across restarts
    pub tag: String,
    /// Filehandles of delegations revoked from this client; these must not
    /// be reclaimed
    pub revoked: Vec<Bytes>,
}

impl RecoveryRecord {
    /// Record with no revocations
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            revoked: Vec::new(),
        }
    }
}

/// Pluggable persistence backend for recovery records
///
/// All methods operate on the *current* generation except `read_clients`,
/// which rotates the current generation into the previous one and returns
/// the rotated set — the clients known to the previous incarnation.
pub trait RecoveryLedger: Send + Sync {
    /// Rotate generations and return the previous incarnation's records
    fn read_clients(&self) -> StateResult<Vec<RecoveryRecord>>;

    /// Record that `tag` holds reclaimable state
    fn persist_add(&self, tag: &str) -> StateResult<()>;

    /// Remove `tag` from the current generation
    fn persist_remove(&self, tag: &str) -> StateResult<()>;

    /// Append a revoked filehandle to `tag`'s current record
    fn persist_revoke(&self, tag: &str, handle: &Bytes) -> StateResult<()>;

    /// Drop previous-generation records for clients that never returned
    fn purge_stale(&self) -> StateResult<()>;

    /// Grace has lifted: the previous generation is no longer needed
    fn swap_generation(&self) -> StateResult<()>;
}

/// In-memory ledger for tests and graceless deployments
pub struct MemoryLedger {
    current: Mutex<HashMap<String, Vec<Bytes>>>,
    previous: Mutex<HashMap<String, Vec<Bytes>>>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self {
            current: Mutex::new(HashMap::new()),
            previous: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryLedger for MemoryLedger {
    fn read_clients(&self) -> StateResult<Vec<RecoveryRecord>> {
        let mut current = self.current.lock();
        let mut previous = self.previous.lock();
        *previous = std::mem::take(&mut *current);
        Ok(previous
            .iter()
            .map(|(tag, revoked)| RecoveryRecord {
                tag: tag.clone(),
                revoked: revoked.clone(),
            })
            .collect())
    }

    fn persist_add(&self, tag: &str) -> StateResult<()> {
        self.current.lock().entry(tag.to_string()).or_default();
        Ok(())
    }

    fn persist_remove(&self, tag: &str) -> StateResult<()> {
        self.current.lock().remove(tag);
        Ok(())
    }

    fn persist_revoke(&self, tag: &str, handle: &Bytes) -> StateResult<()> {
        self.current
            .lock()
            .entry(tag.to_string())
            .or_default()
            .push(handle.clone());
        Ok(())
    }

    fn purge_stale(&self) -> StateResult<()> {
        let current = self.current.lock();
        self.previous
            .lock()
            .retain(|tag, _| current.contains_key(tag));
        Ok(())
    }

    fn swap_generation(&self) -> StateResult<()> {
        self.previous.lock().clear();
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct RevokedFile {
    revoked: Vec<String>,
}

/// Directory-tree ledger
///
/// One directory per client under `<root>/current`, named by the hex-encoded
/// recovery tag, with revoked filehandles in a JSON file inside. A restart's
/// `read_clients` renames `current` to `previous` and starts fresh. The
/// directory hierarchy is one legitimate encoding of the ledger contract,
/// not a structural requirement.
pub struct DirLedger {
    root: PathBuf,
}

impl DirLedger {
    /// Open (creating if needed) a ledger rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> StateResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("current")).map_err(io_fault)?;
        Ok(Self { root })
    }

    fn current(&self) -> PathBuf {
        self.root.join("current")
    }

    fn previous(&self) -> PathBuf {
        self.root.join("previous")
    }

    fn tag_dir(&self, tag: &str) -> PathBuf {
        self.current().join(hex_encode(tag.as_bytes()))
    }

    fn read_record(dir: &Path) -> StateResult<Option<RecoveryRecord>> {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some(tag_bytes) = hex_decode(name) else {
            warn!(dir = %dir.display(), "skipping undecodable recovery entry");
            return Ok(None);
        };
        let tag = String::from_utf8_lossy(&tag_bytes).into_owned();

        let revoked_path = dir.join("revoked.json");
        let revoked = if revoked_path.exists() {
            let data = fs::read_to_string(&revoked_path).map_err(io_fault)?;
            let parsed: RevokedFile =
                serde_json::from_str(&data).map_err(|e| StateError::ServerFault(e.to_string()))?;
            parsed
                .revoked
                .iter()
                .filter_map(|h| hex_decode(h))
                .map(Bytes::from)
                .collect()
        } else {
            Vec::new()
        };
        Ok(Some(RecoveryRecord { tag, revoked }))
    }
}

impl RecoveryLedger for DirLedger {
    fn read_clients(&self) -> StateResult<Vec<RecoveryRecord>> {
        let prev = self.previous();
        if !prev.exists() && self.current().exists() {
            fs::rename(self.current(), &prev).map_err(io_fault)?;
        }
        fs::create_dir_all(self.current()).map_err(io_fault)?;

        let mut records = Vec::new();
        if prev.exists() {
            for entry in fs::read_dir(&prev).map_err(io_fault)? {
                let entry = entry.map_err(io_fault)?;
                if let Some(record) = Self::read_record(&entry.path())? {
                    records.push(record);
                }
            }
        }
        debug!(count = records.len(), "loaded recovery records");
        Ok(records)
    }

    fn persist_add(&self, tag: &str) -> StateResult<()> {
        fs::create_dir_all(self.tag_dir(tag)).map_err(io_fault)
    }

    fn persist_remove(&self, tag: &str) -> StateResult<()> {
        let dir = self.tag_dir(tag);
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(io_fault)?;
        }
        Ok(())
    }

    fn persist_revoke(&self, tag: &str, handle: &Bytes) -> StateResult<()> {
        let dir = self.tag_dir(tag);
        fs::create_dir_all(&dir).map_err(io_fault)?;
        let path = dir.join("revoked.json");
        let mut parsed: RevokedFile = if path.exists() {
            let data = fs::read_to_string(&path).map_err(io_fault)?;
            serde_json::from_str(&data).map_err(|e| StateError::ServerFault(e.to_string()))?
        } else {
            RevokedFile::default()
        };
        parsed.revoked.push(hex_encode(handle));
        let data =
            serde_json::to_string(&parsed).map_err(|e| StateError::ServerFault(e.to_string()))?;
        fs::write(&path, data).map_err(io_fault)
    }

    fn purge_stale(&self) -> StateResult<()> {
        let prev = self.previous();
        if !prev.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&prev).map_err(io_fault)? {
            let entry = entry.map_err(io_fault)?;
            let name = entry.file_name();
            if !self.current().join(&name).exists() {
                fs::remove_dir_all(entry.path()).map_err(io_fault)?;
            }
        }
        Ok(())
    }

    fn swap_generation(&self) -> StateResult<()> {
        let prev = self.previous();
        if prev.exists() {
            fs::remove_dir_all(prev).map_err(io_fault)?;
        }
        Ok(())
    }
}

fn io_fault(err: std::io::Error) -> StateError {
    StateError::ServerFault(err.to_string())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Cluster coordination hooks
///
/// A clustered deployment implements these against its membership layer; a
/// standalone server uses [`LocalNode`].
pub trait ClusterHooks: Send + Sync {
    /// Ask the cluster whether this node should enter grace now
    fn maybe_start_grace(&self) {}

    /// Whether any cluster node is still enforcing grace
    fn grace_enforcing(&self) -> bool {
        false
    }

    /// Whether this node is part of a cluster
    fn is_cluster_member(&self) -> bool {
        false
    }

    /// This node's cluster identity
    fn get_nodeid(&self) -> Option<String> {
        None
    }
}

/// Standalone-node hooks: every method is a no-op
pub struct LocalNode;

impl ClusterHooks for LocalNode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_ledger_rotation() {
        let ledger = MemoryLedger::new();
        ledger.persist_add("client-a").unwrap();
        ledger
            .persist_revoke("client-a", &Bytes::from_static(b"fh-1"))
            .unwrap();
        ledger.persist_add("client-b").unwrap();
        ledger.persist_remove("client-b").unwrap();

        let mut records = ledger.read_clients().unwrap();
        records.sort_by(|a, b| a.tag.cmp(&b.tag));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tag, "client-a");
        assert_eq!(records[0].revoked, vec![Bytes::from_static(b"fh-1")]);

        // a second restart with nothing re-added sees an empty set
        let records = ledger.read_clients().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_dir_ledger_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DirLedger::new(dir.path()).unwrap();

        ledger.persist_add("host-1/10.0.0.5").unwrap();
        ledger
            .persist_revoke("host-1/10.0.0.5", &Bytes::from_static(&[0xAA, 0xBB]))
            .unwrap();

        let records = ledger.read_clients().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tag, "host-1/10.0.0.5");
        assert_eq!(records[0].revoked, vec![Bytes::from_static(&[0xAA, 0xBB])]);

        // lift drops the previous generation
        ledger.swap_generation().unwrap();
        let records = ledger.read_clients().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_dir_ledger_purge_stale() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DirLedger::new(dir.path()).unwrap();

        ledger.persist_add("returning").unwrap();
        ledger.persist_add("ghost").unwrap();
        ledger.read_clients().unwrap();

        // only one client re-registers in the new incarnation
        ledger.persist_add("returning").unwrap();
        ledger.purge_stale().unwrap();

        let prev = dir.path().join("previous");
        assert!(prev.join(hex_encode(b"returning")).exists());
        assert!(!prev.join(hex_encode(b"ghost")).exists());
    }

    #[test]
    fn test_hex_roundtrip() {
        let data = b"node-a:2049";
        assert_eq!(hex_decode(&hex_encode(data)).unwrap(), data);
        assert!(hex_decode("abc").is_none());
    }
}
