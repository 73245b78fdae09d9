//! Open file handles.
//!
//! An encrypted file handle carries no state of its own: the plaintext lives
//! in the volume's cache, shared by every handle on the same path, and the
//! handle only remembers its inode so renames of open files are followed.
//! Plain files in the data directory get a real OS file handle.

use dashmap::DashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

/// A handle stored in the [`FreyaHandleTable`].
#[derive(Debug)]
pub enum FreyaHandle {
    /// Reference to an open cache entry; the path is resolved through the
    /// inode table at each use.
    Encrypted { ino: u64 },

    /// Unencrypted file in the data directory.
    Passthrough(File),
}

impl FreyaHandle {
    /// Inode of an encrypted handle, `None` for a passthrough file.
    pub fn encrypted_ino(&self) -> Option<u64> {
        match self {
            FreyaHandle::Encrypted { ino } => Some(*ino),
            FreyaHandle::Passthrough(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            FreyaHandle::Passthrough(file) => Some(file),
            FreyaHandle::Encrypted { .. } => None,
        }
    }
}

/// Thread-safe table of open handles with auto-incrementing ids.
#[derive(Debug)]
pub struct FreyaHandleTable {
    handles: DashMap<u64, FreyaHandle>,
    next_id: AtomicU64,
}

impl Default for FreyaHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FreyaHandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            // 0 is never handed out, so it can mean "no handle"
            next_id: AtomicU64::new(1),
        }
    }

    /// Stores `handle` and returns its id.
    pub fn insert(&self, handle: FreyaHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, handle);
        id
    }

    pub fn get(&self, id: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, FreyaHandle>> {
        self.handles.get(&id)
    }

    pub fn remove(&self, id: u64) -> Option<FreyaHandle> {
        self.handles.remove(&id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
