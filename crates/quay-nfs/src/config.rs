//! NFS state-service configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the stateful NFS service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfsConfig {
    /// How long a client may go silent before its lease lapses
    pub lease_time: Duration,
    /// Length of the post-restart grace window
    pub grace_period: Duration,
    /// Skip grace entirely (test rigs, ephemeral exports)
    pub graceless: bool,
    /// Serve NLM (NFSv3 locking) alongside v4
    pub nlm_enabled: bool,
    /// Server-side cap on session slots
    pub max_session_slots: u32,
    /// Maximum operations accepted per compound
    pub max_compound_ops: usize,
    /// Where the directory recovery ledger lives; in-memory when unset
    pub recovery_root: Option<PathBuf>,
    /// Cluster node identity, when part of a cluster
    pub node_id: Option<String>,
    /// How often the background reaper runs
    pub reaper_interval: Duration,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            lease_time: Duration::from_secs(90),
            grace_period: Duration::from_secs(90),
            graceless: false,
            nlm_enabled: false,
            max_session_slots: 16,
            max_compound_ops: 16,
            recovery_root: None,
            node_id: None,
            reaper_interval: Duration::from_secs(1),
        }
    }
}

impl NfsConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease time
    pub fn lease_time(mut self, lease: Duration) -> Self {
        self.lease_time = lease;
        self
    }

    /// Set the grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Disable the grace period
    pub fn graceless(mut self) -> Self {
        self.graceless = true;
        self
    }

    /// Enable NLM support
    pub fn with_nlm(mut self) -> Self {
        self.nlm_enabled = true;
        self
    }

    /// Set the session slot cap
    pub fn max_session_slots(mut self, slots: u32) -> Self {
        self.max_session_slots = slots;
        self
    }

    /// Persist recovery records under `root`
    pub fn recovery_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.recovery_root = Some(root.into());
        self
    }

    /// Set the cluster node id
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NfsConfig::default();
        assert_eq!(config.lease_time, Duration::from_secs(90));
        assert_eq!(config.grace_period, Duration::from_secs(90));
        assert!(!config.graceless);
        assert_eq!(config.max_session_slots, 16);
        assert!(config.recovery_root.is_none());
    }

    #[test]
    fn test_builder() {
        let config = NfsConfig::new()
            .lease_time(Duration::from_secs(30))
            .grace_period(Duration::from_secs(45))
            .with_nlm()
            .max_session_slots(64)
            .recovery_root("/var/lib/quay/recovery")
            .node_id("node-a");

        assert_eq!(config.lease_time, Duration::from_secs(30));
        assert!(config.nlm_enabled);
        assert_eq!(config.max_session_slots, 64);
        assert_eq!(
            config.recovery_root.as_deref(),
            Some(std::path::Path::new("/var/lib/quay/recovery"))
        );
        assert_eq!(config.node_id.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = NfsConfig::new().graceless().node_id("n1");
        let json = serde_json::to_string(&config).unwrap();
        let back: NfsConfig = serde_json::from_str(&json).unwrap();
        assert!(back.graceless);
        assert_eq!(back.node_id.as_deref(), Some("n1"));
    }
}
