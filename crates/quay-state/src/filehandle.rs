//! Opaque filehandles and the file-identity collaborator interface
//!
//! The state layer never interprets filehandle bytes. Handles are resolved to
//! a stable [`FileId`] by the metadata-cache layer through
//! [`FileIdentityProvider`]; everything downstream keys on the id.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{StateError, StateResult};

/// Maximum filehandle size accepted on the wire (NFS4_FHSIZE)
pub const MAX_FILEHANDLE_SIZE: usize = 128;

/// Stable identifier for a filesystem object
pub type FileId = u64;

/// Opaque NFS filehandle (max 128 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(Bytes);

impl FileHandle {
    /// Create a filehandle from opaque bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Check the handle fits the wire limit
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= MAX_FILEHANDLE_SIZE
    }
}

/// Kind of filesystem object a [`FileId`] resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Anything else (devices, sockets, fifos)
    Other,
}

/// Identity provider implemented by the metadata-cache layer
///
/// Open and lock state is only meaningful on regular files; callers use
/// [`FileIdentityProvider::file_kind`] to reject the rest before touching
/// shared state.
pub trait FileIdentityProvider: Send + Sync {
    /// Resolve a filehandle to its stable file identity
    fn file_identity(&self, handle: &FileHandle) -> StateResult<FileId>;

    /// Kind of the object a previously resolved id refers to
    fn file_kind(&self, id: FileId) -> StateResult<FileKind>;
}

/// In-memory identity provider
///
/// Registers handles explicitly; unknown handles resolve to `BadHandle`.
/// Used by tests and by deployments that front a flat object namespace.
pub struct MapIdentityProvider {
    by_handle: DashMap<FileHandle, FileId>,
    kinds: DashMap<FileId, FileKind>,
    next_id: AtomicU64,
}

impl MapIdentityProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self {
            by_handle: DashMap::new(),
            kinds: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handle, assigning it a fresh file id
    pub fn register(&self, handle: FileHandle, kind: FileKind) -> FileId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.kinds.insert(id, kind);
        self.by_handle.insert(handle, id);
        id
    }

    /// Drop a handle, leaving later lookups to fail with `FhExpired`
    pub fn expire(&self, handle: &FileHandle) {
        if let Some((_, id)) = self.by_handle.remove(handle) {
            self.kinds.remove(&id);
        }
    }
}

impl Default for MapIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIdentityProvider for MapIdentityProvider {
    fn file_identity(&self, handle: &FileHandle) -> StateResult<FileId> {
        if !handle.is_valid() {
            return Err(StateError::BadHandle);
        }
        self.by_handle
            .get(handle)
            .map(|r| *r)
            .ok_or(StateError::FhExpired)
    }

    fn file_kind(&self, id: FileId) -> StateResult<FileKind> {
        self.kinds.get(&id).map(|r| *r).ok_or(StateError::FhExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_validity() {
        assert!(FileHandle::new(vec![1, 2, 3]).is_valid());
        assert!(!FileHandle::new(Vec::new()).is_valid());
        assert!(!FileHandle::new(vec![0u8; 129]).is_valid());
    }

    #[test]
    fn test_map_provider_resolution() {
        let provider = MapIdentityProvider::new();
        let fh = FileHandle::new(vec![7, 7, 7]);
        let id = provider.register(fh.clone(), FileKind::Regular);

        assert_eq!(provider.file_identity(&fh).unwrap(), id);
        assert_eq!(provider.file_kind(id).unwrap(), FileKind::Regular);

        provider.expire(&fh);
        assert_eq!(provider.file_identity(&fh), Err(StateError::FhExpired));
    }

    #[test]
    fn test_unknown_handle() {
        let provider = MapIdentityProvider::new();
        let fh = FileHandle::new(vec![9]);
        assert_eq!(provider.file_identity(&fh), Err(StateError::FhExpired));
    }
}
