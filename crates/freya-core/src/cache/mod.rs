//! Write-back plaintext cache for open encrypted files.
//!
//! One cache entry exists per open logical path, shared by every handle
//! open on that path and reference counted by open/release. Reads and writes
//! only touch the in-memory [`ByteBuffer`]; the codec runs on `open`
//! (decrypt) and on `flush` when the entry is dirty (encrypt).
//!
//! # Locking
//!
//! The path map sits behind one lock that is only held while the map itself
//! is looked up or changed, never across codec I/O. Each entry carries its
//! own lock for content and bookkeeping, so two writers on the same path are
//! ordered, and a write racing a flush either lands in the snapshot being
//! encrypted or re-marks the entry dirty for the next flush. A second lock
//! per entry serialises flushes, so two encodes of one path never overlap;
//! writers do not wait for it.
//!
//! # Detached entries
//!
//! Unlinking or replacing an open file must not leave its entry at the path,
//! where a new file of the same name would pick it up. [`PlaintextCache::detach`]
//! moves the entry to a key that no logical path can produce (it does not
//! start with `/`). Handles keep reading, writing and releasing it under that
//! key; it has no backing path, so flushing it does nothing.
//!
//! # Timestamps
//!
//! The entry remembers the file's atime/mtime (mtime is taken from disk at
//! open, and bumped by writes). `flush` puts them back on the backing path:
//! before encrypting when the path already exists, after encrypting when the
//! encrypt is what creates it.

use crate::buffer::{BufferError, ByteBuffer};
use crate::codec::{Codec, CodecError};
use crate::keys::{FileIv, FileKey};
use crate::path;
use filetime::FileTime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors from cache operations that reach the disk.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Failed to restore timestamps on {path}: {source}")]
    Timestamps {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a [`PlaintextCache::flush`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No entry for the path, or the entry is detached; nothing to flush.
    NotOpen,
    /// Content matched disk; timestamps restored, codec not called.
    Clean,
    /// Content was re-encrypted.
    Encrypted,
}

struct EntryState {
    content: ByteBuffer,
    dirty: bool,
    atime: SystemTime,
    mtime: SystemTime,
}

/// Plaintext and bookkeeping of one open file.
struct CacheEntry {
    state: Mutex<EntryState>,
    /// Held for the whole of a flush.
    flushing: Mutex<()>,
}

impl CacheEntry {
    fn new(content: ByteBuffer, dirty: bool, atime: SystemTime, mtime: SystemTime) -> Self {
        Self {
            state: Mutex::new(EntryState {
                content,
                dirty,
                atime,
                mtime,
            }),
            flushing: Mutex::new(()),
        }
    }
}

struct Slot {
    entry: Arc<CacheEntry>,
    open_count: u32,
}

/// The write-back cache.
///
/// Keys are logical paths; the codec is invoked on the matching physical
/// path below `root`.
pub struct PlaintextCache<C: Codec> {
    codec: C,
    root: PathBuf,
    entries: Mutex<HashMap<String, Slot>>,
    next_detached: AtomicU64,
}

impl<C: Codec> std::fmt::Debug for PlaintextCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaintextCache")
            .field("root", &self.root)
            .field("open_entries", &self.len())
            .finish_non_exhaustive()
    }
}

fn set_times(physical: &Path, atime: SystemTime, mtime: SystemTime) -> Result<(), CacheError> {
    filetime::set_file_times(
        physical,
        FileTime::from_system_time(atime),
        FileTime::from_system_time(mtime),
    )
    .map_err(|source| CacheError::Timestamps {
        path: physical.to_path_buf(),
        source,
    })
}

/// Whether `key` names a detached entry rather than a logical path.
pub fn is_detached(key: &str) -> bool {
    !key.starts_with('/')
}

impl<C: Codec> PlaintextCache<C> {
    pub fn new(codec: C, root: impl Into<PathBuf>) -> Self {
        Self {
            codec,
            root: root.into(),
            entries: Mutex::new(HashMap::new()),
            next_detached: AtomicU64::new(1),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn physical(&self, logical: &str) -> PathBuf {
        path::physical(&self.root, logical)
    }

    fn entry(&self, path: &str) -> Option<Arc<CacheEntry>> {
        self.entries
            .lock()
            .get(path)
            .map(|slot| Arc::clone(&slot.entry))
    }

    /// Acquire a reference to `path`, decrypting it if not already open.
    ///
    /// `mtime` becomes the entry's modification time, so a file that is
    /// opened and flushed without writes keeps its on-disk timestamp.
    ///
    /// # Errors
    ///
    /// A failed decrypt leaves no entry behind.
    pub fn open(
        &self,
        path: &str,
        key: &FileKey,
        iv: &FileIv,
        mtime: SystemTime,
    ) -> Result<(), CacheError> {
        {
            let mut entries = self.entries.lock();
            if let Some(slot) = entries.get_mut(path) {
                slot.open_count += 1;
                trace!(path, open_count = slot.open_count, "Reopened cached file");
                return Ok(());
            }
        }

        let plaintext = self
            .codec
            .decrypt(&self.physical(path), key, iv)
            .inspect_err(|e| warn!(path, error = %e, "Decrypt on open failed"))?;
        let size = plaintext.len();
        let entry = Arc::new(CacheEntry::new(
            ByteBuffer::new(plaintext),
            false,
            SystemTime::now(),
            mtime,
        ));

        let mut entries = self.entries.lock();
        match entries.entry(path.to_string()) {
            // another opener decrypted concurrently and won; share its entry
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().open_count += 1;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    entry,
                    open_count: 1,
                });
                debug!(path, size, "Opened file into cache");
            }
        }
        Ok(())
    }

    /// Acquire a reference to a new empty file and write it to disk at once.
    ///
    /// If `path` is already open this only bumps the reference count. If the
    /// initial flush fails the reference is released again.
    pub fn create(&self, path: &str, key: &FileKey, iv: &FileIv) -> Result<(), CacheError> {
        {
            let mut entries = self.entries.lock();
            match entries.entry(path.to_string()) {
                Entry::Occupied(mut occupied) => {
                    occupied.get_mut().open_count += 1;
                    return Ok(());
                }
                Entry::Vacant(vacant) => {
                    let now = SystemTime::now();
                    vacant.insert(Slot {
                        entry: Arc::new(CacheEntry::new(ByteBuffer::empty(), true, now, now)),
                        open_count: 1,
                    });
                }
            }
        }
        debug!(path, "Created file in cache");

        if let Err(e) = self.flush(path, key, iv) {
            self.release(path);
            return Err(e);
        }
        Ok(())
    }

    /// Read up to `size` bytes at `offset`, or `None` if `path` is not open.
    pub fn read_bytes(&self, path: &str, offset: u64, size: usize) -> Option<Vec<u8>> {
        let entry = self.entry(path)?;
        let state = entry.state.lock();
        Some(state.content.read(offset, size).to_vec())
    }

    /// Write `data` at `offset`, marking the entry dirty.
    ///
    /// # Errors
    ///
    /// [`CacheError::Buffer`] if the content cannot grow that far; the entry
    /// is left as it was.
    ///
    /// # Returns
    ///
    /// Bytes written, or `None` if `path` is not open.
    pub fn write_bytes(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<Option<usize>, CacheError> {
        let Some(entry) = self.entry(path) else {
            return Ok(None);
        };
        let mut state = entry.state.lock();
        let written = state.content.write(offset, data)?;
        state.dirty = true;
        state.mtime = SystemTime::now();
        Ok(Some(written))
    }

    /// Resize the content to `size`, marking the entry dirty.
    ///
    /// Returns `false` if `path` is not open.
    pub fn truncate_bytes(&self, path: &str, size: u64) -> Result<bool, CacheError> {
        let Some(entry) = self.entry(path) else {
            return Ok(false);
        };
        let mut state = entry.state.lock();
        state.content.truncate(size)?;
        state.dirty = true;
        state.mtime = SystemTime::now();
        Ok(true)
    }

    /// Write the entry back through the codec if it is dirty.
    ///
    /// # Errors
    ///
    /// On a codec failure the entry stays dirty, so a later flush retries.
    pub fn flush(&self, path: &str, key: &FileKey, iv: &FileIv) -> Result<FlushOutcome, CacheError> {
        if is_detached(path) {
            return Ok(FlushOutcome::NotOpen);
        }
        let Some(entry) = self.entry(path) else {
            return Ok(FlushOutcome::NotOpen);
        };
        let _flushing = entry.flushing.lock();

        let physical = self.physical(path);
        let existed = physical.exists();
        if existed {
            let (atime, mtime) = {
                let state = entry.state.lock();
                (state.atime, state.mtime)
            };
            set_times(&physical, atime, mtime)?;
        }

        let snapshot = {
            let mut state = entry.state.lock();
            if !state.dirty {
                trace!(path, "Flush skipped, entry clean");
                return Ok(FlushOutcome::Clean);
            }
            state.dirty = false;
            state.content.as_slice().to_vec()
        };

        if let Err(e) = self.codec.encrypt(&snapshot, &physical, key, iv) {
            entry.state.lock().dirty = true;
            warn!(path, error = %e, "Encrypt on flush failed, entry left dirty");
            return Err(e.into());
        }

        if !existed {
            let (atime, mtime) = {
                let state = entry.state.lock();
                (state.atime, state.mtime)
            };
            set_times(&physical, atime, mtime)?;
        }

        debug!(path, size = snapshot.len(), "Flushed file");
        Ok(FlushOutcome::Encrypted)
    }

    /// Drop one reference to `path`, evicting the entry at zero.
    ///
    /// Unflushed content is discarded on eviction.
    ///
    /// # Returns
    ///
    /// The remaining reference count, or `None` if `path` was not open.
    pub fn release(&self, path: &str) -> Option<u32> {
        let mut entries = self.entries.lock();
        let slot = entries.get_mut(path)?;
        slot.open_count -= 1;
        let remaining = slot.open_count;
        if remaining == 0 {
            if let Some(slot) = entries.remove(path)
                && slot.entry.state.lock().dirty
            {
                warn!(path, "Evicted cache entry with unflushed changes");
            }
            debug!(path, "Evicted cache entry");
        } else {
            trace!(path, open_count = remaining, "Released cache reference");
        }
        Some(remaining)
    }

    /// Plaintext length, or `None` if `path` is not open.
    pub fn get_size(&self, path: &str) -> Option<u64> {
        let entry = self.entry(path)?;
        let size = entry.state.lock().content.len();
        Some(size)
    }

    /// Move the entry at `path` to a fresh detached key.
    ///
    /// Handles holding the entry must switch to the returned key; `path` is
    /// free for a new file afterwards.
    ///
    /// # Returns
    ///
    /// The detached key, or `None` if `path` is not open.
    pub fn detach(&self, path: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        self.detach_locked(&mut entries, path)
    }

    fn detach_locked(&self, entries: &mut HashMap<String, Slot>, path: &str) -> Option<String> {
        let slot = entries.remove(path)?;
        let id = self.next_detached.fetch_add(1, Ordering::Relaxed);
        let key = format!("~detached/{id}{path}");
        debug!(path, key = %key, open_count = slot.open_count, "Detached cache entry");
        entries.insert(key.clone(), slot);
        Some(key)
    }

    /// Move the entry at `old` to `new`, keeping its content, dirty flag and
    /// reference count. An entry already open at `new` is detached first.
    /// Returns `false` if `old` is not open.
    pub fn rename(&self, old: &str, new: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(slot) = entries.remove(old) else {
            return false;
        };
        if let Some(key) = self.detach_locked(&mut entries, new) {
            warn!(old, new, key = %key, "Rename replaced an open cache entry");
        }
        entries.insert(new.to_string(), slot);
        debug!(old, new, "Renamed cache entry");
        true
    }

    /// Move every entry at or below the directory `old_prefix`.
    ///
    /// # Returns
    ///
    /// The number of entries moved.
    pub fn rename_prefix(&self, old_prefix: &str, new_prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let affected: Vec<String> = entries
            .keys()
            .filter(|p| path::is_under(p, old_prefix))
            .cloned()
            .collect();
        for old in &affected {
            if let Some(new) = path::rebase(old, old_prefix, new_prefix)
                && let Some(slot) = entries.remove(old)
            {
                entries.insert(new, slot);
            }
        }
        affected.len()
    }

    /// Override the entry's timestamps; they are applied on the next flush.
    ///
    /// Returns `false` if `path` is not open.
    pub fn set_times(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> bool {
        let Some(entry) = self.entry(path) else {
            return false;
        };
        let mut state = entry.state.lock();
        if let Some(atime) = atime {
            state.atime = atime;
        }
        if let Some(mtime) = mtime {
            state.mtime = mtime;
        }
        true
    }

    /// `(atime, mtime)` of an open entry.
    pub fn times(&self, path: &str) -> Option<(SystemTime, SystemTime)> {
        let entry = self.entry(path)?;
        let state = entry.state.lock();
        Some((state.atime, state.mtime))
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn open_count(&self, path: &str) -> Option<u32> {
        self.entries.lock().get(path).map(|slot| slot.open_count)
    }

    pub fn is_dirty(&self, path: &str) -> Option<bool> {
        let entry = self.entry(path)?;
        let dirty = entry.state.lock().dirty;
        Some(dirty)
    }

    /// Number of open entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
