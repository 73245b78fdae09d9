//! One mounted data directory.
//!
//! [`Volume`] bundles the data root, the [`MetadataStore`] and the
//! [`PlaintextCache`] and exposes the file operations a filesystem driver
//! needs for encrypted paths, each calling the store and the cache in a fixed
//! order. It is the single shared service object of a mount; drivers hold it
//! in an `Arc`.
//!
//! Paths are logical (`/docs/a.txt`). A path is encrypted exactly when the
//! store has a record for it. Everything else (directories, symlinks, plain
//! files already present in the data directory) is left to the driver,
//! except for `unlink` and `rename`, which the volume performs for any path
//! so that records and open entries follow the storage change.
//!
//! A file that is unlinked or replaced while open keeps its plaintext under
//! a detached key (see [`crate::cache`]). The driver re-points its handles
//! at that key; reads, writes and release keep working, flush is a no-op.

use crate::cache::{self, CacheError, FlushOutcome, PlaintextCache};
use crate::codec::{Codec, MixSliceCodec};
use crate::envelope::Envelope;
use crate::metadata::{MetadataError, MetadataStore};
use crate::path;
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default name of the metadata file inside the data directory.
pub const DEFAULT_METADATA_FILE: &str = ".freyafs";

/// Errors from volume operations.
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The path is the volume's own metadata file.
    #[error("{path} is reserved for volume metadata")]
    Protected { path: String },

    /// A content operation on an encrypted file that has no open handle.
    #[error("{path} is not open")]
    NotOpen { path: String },

    #[error("Data directory {path} is not a directory")]
    NotADirectory { path: PathBuf },
}

impl VolumeError {
    fn io(path: &Path, source: io::Error) -> Self {
        VolumeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn not_open(path: &str) -> Self {
        VolumeError::NotOpen {
            path: path.to_string(),
        }
    }
}

/// An encrypted data directory and the state needed to serve it.
pub struct Volume<C: Codec = MixSliceCodec> {
    root: PathBuf,
    metadata_name: String,
    store: MetadataStore,
    cache: PlaintextCache<C>,
}

impl<C: Codec> std::fmt::Debug for Volume<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("root", &self.root)
            .field("store", &self.store)
            .field("cache", &self.cache)
            .finish()
    }
}

impl<C: Codec> Volume<C> {
    /// Open the volume rooted at `root`, loading `<root>/<metadata_name>`.
    pub fn open(
        root: impl Into<PathBuf>,
        metadata_name: &str,
        codec: C,
        envelope: Box<dyn Envelope>,
    ) -> Result<Self, VolumeError> {
        let root = root.into();
        let meta = fs::metadata(&root).map_err(|e| VolumeError::io(&root, e))?;
        if !meta.is_dir() {
            return Err(VolumeError::NotADirectory { path: root });
        }

        let store = MetadataStore::open(root.join(metadata_name), envelope)?;
        let cache = PlaintextCache::new(codec, &root);
        info!(root = %root.display(), encrypted_files = store.len(), "Opened volume");

        Ok(Self {
            root,
            metadata_name: metadata_name.to_string(),
            store,
            cache,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn cache(&self) -> &PlaintextCache<C> {
        &self.cache
    }

    /// Backing path of a logical path.
    pub fn physical(&self, logical: &str) -> PathBuf {
        path::physical(&self.root, logical)
    }

    /// Whether `logical` names the metadata file, which drivers must hide.
    pub fn is_metadata_file(&self, logical: &str) -> bool {
        path::parent(logical) == path::ROOT && path::file_name(logical) == self.metadata_name
    }

    fn guard(&self, logical: &str) -> Result<(), VolumeError> {
        if self.is_metadata_file(logical) {
            return Err(VolumeError::Protected {
                path: logical.to_string(),
            });
        }
        Ok(())
    }

    pub fn is_encrypted(&self, logical: &str) -> bool {
        self.store.contains(logical)
    }

    /// Whether `key` is the detached key of an unlinked or replaced file.
    pub fn is_detached(&self, key: &str) -> bool {
        cache::is_detached(key)
    }

    /// Open an encrypted file, decrypting it unless it is already open.
    pub fn open_file(&self, logical: &str) -> Result<(), VolumeError> {
        self.guard(logical)?;
        let record = self.store.get(logical)?;
        let physical = self.physical(logical);
        let mtime = fs::metadata(&physical)
            .and_then(|m| m.modified())
            .map_err(|e| VolumeError::io(&physical, e))?;
        self.cache.open(logical, &record.key, &record.iv, mtime)?;
        Ok(())
    }

    /// Create a new empty encrypted file and open it.
    ///
    /// If the file cannot be written, the new record is dropped again.
    pub fn create_file(&self, logical: &str) -> Result<(), VolumeError> {
        self.guard(logical)?;
        let (key, iv) = self.store.add(logical)?;
        if let Err(e) = self.cache.create(logical, &key, &iv) {
            if let Err(cleanup) = self.store.remove(logical) {
                warn!(path = logical, error = %cleanup, "Failed to drop record of failed create");
            }
            let physical = self.physical(logical);
            if physical.is_dir()
                && let Err(cleanup) = fs::remove_dir_all(&physical)
            {
                warn!(path = logical, error = %cleanup, "Failed to remove fragments of failed create");
            }
            return Err(e.into());
        }
        debug!(path = logical, "Created encrypted file");
        Ok(())
    }

    pub fn read(&self, logical: &str, offset: u64, size: usize) -> Result<Vec<u8>, VolumeError> {
        self.cache
            .read_bytes(logical, offset, size)
            .ok_or_else(|| VolumeError::not_open(logical))
    }

    /// Write into an open file and record its new size.
    ///
    /// A detached file has no record; only its plaintext changes.
    pub fn write(&self, logical: &str, data: &[u8], offset: u64) -> Result<usize, VolumeError> {
        let written = self
            .cache
            .write_bytes(logical, data, offset)?
            .ok_or_else(|| VolumeError::not_open(logical))?;
        if cache::is_detached(logical) {
            return Ok(written);
        }
        let size = self
            .cache
            .get_size(logical)
            .ok_or_else(|| VolumeError::not_open(logical))?;
        self.store.update(logical, size)?;
        Ok(written)
    }

    /// Resize an encrypted file and record its new size.
    ///
    /// A file with no open handle is opened for the duration of the call and
    /// written back before returning.
    pub fn truncate(&self, logical: &str, size: u64) -> Result<(), VolumeError> {
        if self.cache.truncate_bytes(logical, size)? {
            if !cache::is_detached(logical) {
                self.store.update(logical, size)?;
            }
            return Ok(());
        }

        self.open_file(logical)?;
        let result = self.truncate_open(logical, size);
        self.cache.release(logical);
        result
    }

    fn truncate_open(&self, logical: &str, size: u64) -> Result<(), VolumeError> {
        if !self.cache.truncate_bytes(logical, size)? {
            return Err(VolumeError::not_open(logical));
        }
        self.flush(logical)?;
        self.store.update(logical, size)?;
        Ok(())
    }

    /// Write an open file back to disk if it changed.
    ///
    /// A detached file has nothing to write to and reports
    /// [`FlushOutcome::NotOpen`].
    pub fn flush(&self, logical: &str) -> Result<FlushOutcome, VolumeError> {
        if cache::is_detached(logical) || !self.cache.is_open(logical) {
            return Ok(FlushOutcome::NotOpen);
        }
        let record = match self.store.get(logical) {
            Ok(record) => record,
            Err(MetadataError::NotFound { .. }) => {
                debug!(path = logical, "Skipping flush of unlinked file");
                return Ok(FlushOutcome::NotOpen);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.cache.flush(logical, &record.key, &record.iv)?)
    }

    /// Drop one handle's reference. Returns the remaining count.
    pub fn release(&self, logical: &str) -> Option<u32> {
        self.cache.release(logical)
    }

    /// Plaintext size as recorded in the store, or held in memory for a
    /// detached file.
    pub fn file_size(&self, logical: &str) -> Result<u64, VolumeError> {
        if cache::is_detached(logical) {
            return self
                .cache
                .get_size(logical)
                .ok_or_else(|| VolumeError::not_open(logical));
        }
        Ok(self.store.get(logical)?.size)
    }

    /// Set access and/or modification time of an encrypted file.
    ///
    /// An open entry keeps the new times, so the next flush does not undo
    /// them.
    pub fn set_times(
        &self,
        logical: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), VolumeError> {
        self.guard(logical)?;
        self.cache.set_times(logical, atime, mtime);
        if cache::is_detached(logical) {
            return Ok(());
        }

        let physical = self.physical(logical);
        if let Some(atime) = atime {
            filetime::set_file_atime(&physical, FileTime::from_system_time(atime))
                .map_err(|e| VolumeError::io(&physical, e))?;
        }
        if let Some(mtime) = mtime {
            filetime::set_file_mtime(&physical, FileTime::from_system_time(mtime))
                .map_err(|e| VolumeError::io(&physical, e))?;
        }
        Ok(())
    }

    /// Remove a file. For encrypted files this deletes the fragment
    /// directory and the record.
    ///
    /// # Returns
    ///
    /// The detached key of the file's open entry, if it was open. Handles on
    /// the file must use that key from now on.
    pub fn unlink(&self, logical: &str) -> Result<Option<String>, VolumeError> {
        self.guard(logical)?;
        let physical = self.physical(logical);

        if self.store.contains(logical) {
            match fs::remove_dir_all(&physical) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(VolumeError::io(&physical, e)),
            }
            self.store.remove(logical)?;
            let detached = self.cache.detach(logical);
            debug!(path = logical, ?detached, "Unlinked encrypted file");
            Ok(detached)
        } else {
            fs::remove_file(&physical).map_err(|e| VolumeError::io(&physical, e))?;
            Ok(None)
        }
    }

    /// Rename a file or directory, keeping records and open entries in step.
    ///
    /// An encrypted target is unlinked once the source is known to exist and
    /// to be movable over it, as a plain rename cannot replace a fragment
    /// directory.
    ///
    /// # Returns
    ///
    /// The detached key of the replaced target's open entry, as for
    /// [`Volume::unlink`].
    pub fn rename(&self, old: &str, new: &str) -> Result<Option<String>, VolumeError> {
        self.guard(old)?;
        self.guard(new)?;
        let old_physical = self.physical(old);
        let new_physical = self.physical(new);

        let old_meta =
            fs::symlink_metadata(&old_physical).map_err(|e| VolumeError::io(&old_physical, e))?;
        let old_encrypted = self.store.contains(old);
        let moves_directory = old_meta.is_dir() && !old_encrypted;

        let mut replaced = None;
        if old != new && self.store.contains(new) {
            if moves_directory {
                return Err(VolumeError::io(
                    &new_physical,
                    io::Error::from(io::ErrorKind::NotADirectory),
                ));
            }
            replaced = self.unlink(new)?;
        }

        fs::rename(&old_physical, &new_physical).map_err(|e| VolumeError::io(&old_physical, e))?;

        if old_encrypted {
            self.cache.rename(old, new);
            self.store.rename(old, new)?;
            debug!(old, new, "Renamed encrypted file");
        } else if moves_directory {
            let moved_records = self.store.renamedir(old, new)?;
            let moved_entries = self.cache.rename_prefix(old, new);
            debug!(old, new, moved_records, moved_entries, "Renamed directory");
        }
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::PlainEnvelope;
    use tempfile::TempDir;

    fn volume(dir: &TempDir) -> Volume {
        Volume::open(
            dir.path(),
            DEFAULT_METADATA_FILE,
            MixSliceCodec::new(),
            Box::new(PlainEnvelope),
        )
        .unwrap()
    }

    #[test]
    fn test_open_rejects_non_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            Volume::open(&file, DEFAULT_METADATA_FILE, MixSliceCodec, Box::new(PlainEnvelope)),
            Err(VolumeError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_metadata_file_is_protected() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        assert!(vol.is_metadata_file("/.freyafs"));
        assert!(!vol.is_metadata_file("/sub/.freyafs"));
        assert!(matches!(
            vol.create_file("/.freyafs"),
            Err(VolumeError::Protected { .. })
        ));
        assert!(matches!(
            vol.rename("/.freyafs", "/x"),
            Err(VolumeError::Protected { .. })
        ));
        assert!(matches!(
            vol.unlink("/.freyafs"),
            Err(VolumeError::Protected { .. })
        ));
    }

    #[test]
    fn test_create_write_updates_store_size() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a.txt").unwrap();
        assert!(vol.is_encrypted("/a.txt"));
        assert!(dir.path().join("a.txt").is_dir());

        assert_eq!(vol.write("/a.txt", b"hello", 0).unwrap(), 5);
        assert_eq!(vol.file_size("/a.txt").unwrap(), 5);
        assert_eq!(vol.read("/a.txt", 0, 10).unwrap(), b"hello");
    }

    #[test]
    fn test_create_existing_record_fails() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a").unwrap();
        assert!(matches!(
            vol.create_file("/a"),
            Err(VolumeError::Metadata(MetadataError::AlreadyExists { .. }))
        ));
    }

    #[test]
    fn test_failed_create_drops_record() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        // parent is a regular file, so the fragment directory cannot be made
        fs::write(dir.path().join("blocker"), b"").unwrap();
        assert!(vol.create_file("/blocker/child").is_err());
        assert!(!vol.is_encrypted("/blocker/child"));
        assert!(!vol.cache().is_open("/blocker/child"));
    }

    #[test]
    fn test_content_ops_on_closed_file() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a").unwrap();
        vol.release("/a");

        assert!(matches!(vol.read("/a", 0, 1), Err(VolumeError::NotOpen { .. })));
        assert!(matches!(vol.write("/a", b"x", 0), Err(VolumeError::NotOpen { .. })));
        assert_eq!(vol.flush("/a").unwrap(), FlushOutcome::NotOpen);
    }

    #[test]
    fn test_truncate_closed_file_rewrites_it() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a").unwrap();
        vol.write("/a", b"hello world", 0).unwrap();
        vol.flush("/a").unwrap();
        vol.release("/a");

        vol.truncate("/a", 5).unwrap();
        assert!(!vol.cache().is_open("/a"));
        assert_eq!(vol.file_size("/a").unwrap(), 5);

        vol.open_file("/a").unwrap();
        assert_eq!(vol.read("/a", 0, 100).unwrap(), b"hello");
    }

    #[test]
    fn test_truncate_unknown_file() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        assert!(matches!(
            vol.truncate("/nope", 0),
            Err(VolumeError::Metadata(MetadataError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_unlink_encrypted_and_plain() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/enc").unwrap();
        vol.release("/enc");
        fs::write(dir.path().join("plain"), b"p").unwrap();

        vol.unlink("/enc").unwrap();
        vol.unlink("/plain").unwrap();
        assert!(!vol.is_encrypted("/enc"));
        assert!(!dir.path().join("enc").exists());
        assert!(!dir.path().join("plain").exists());
    }

    #[test]
    fn test_flush_after_unlink_while_open() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a").unwrap();
        vol.write("/a", b"x", 0).unwrap();
        let detached = vol.unlink("/a").unwrap().unwrap();
        assert!(vol.is_detached(&detached));

        assert_eq!(vol.flush("/a").unwrap(), FlushOutcome::NotOpen);
        assert_eq!(vol.flush(&detached).unwrap(), FlushOutcome::NotOpen);
        assert!(!dir.path().join("a").exists());
        assert_eq!(vol.release("/a"), None);
        assert_eq!(vol.release(&detached), Some(0));
    }

    #[test]
    fn test_unlinked_open_file_stays_usable() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a").unwrap();
        vol.write("/a", b"scratch", 0).unwrap();
        let detached = vol.unlink("/a").unwrap().unwrap();

        assert_eq!(vol.write(&detached, b"!", 7).unwrap(), 1);
        vol.truncate(&detached, 4).unwrap();
        assert_eq!(vol.read(&detached, 0, 10).unwrap(), b"scra");
        assert_eq!(vol.file_size(&detached).unwrap(), 4);
        assert!(!vol.is_encrypted(&detached));
    }

    #[test]
    fn test_create_after_unlink_while_open_is_a_new_file() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a").unwrap();
        vol.write("/a", b"old secret", 0).unwrap();
        let detached = vol.unlink("/a").unwrap().unwrap();

        vol.create_file("/a").unwrap();
        assert!(dir.path().join("a").is_dir());
        assert_eq!(vol.read("/a", 0, 10).unwrap(), b"");
        assert_eq!(vol.cache().open_count("/a"), Some(1));
        assert_eq!(vol.file_size("/a").unwrap(), 0);

        assert_eq!(vol.release(&detached), Some(0));
        vol.write("/a", b"new", 0).unwrap();
        vol.flush("/a").unwrap();
        vol.release("/a");
        vol.open_file("/a").unwrap();
        assert_eq!(vol.read("/a", 0, 10).unwrap(), b"new");
    }

    #[test]
    fn test_rename_over_open_target_detaches_it() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/src").unwrap();
        vol.write("/src", b"SRC", 0).unwrap();
        vol.create_file("/dst").unwrap();
        vol.write("/dst", b"DST", 0).unwrap();

        let replaced = vol.rename("/src", "/dst").unwrap().unwrap();
        vol.write(&replaced, b"XX", 0).unwrap();
        assert_eq!(vol.read("/dst", 0, 3).unwrap(), b"SRC");
        assert_eq!(vol.read(&replaced, 0, 3).unwrap(), b"XXT");

        assert_eq!(vol.release(&replaced), Some(0));
        assert_eq!(vol.read("/dst", 0, 3).unwrap(), b"SRC");
        assert_eq!(vol.flush("/dst").unwrap(), FlushOutcome::Encrypted);
        assert_eq!(vol.file_size("/dst").unwrap(), 3);
    }

    #[test]
    fn test_failed_rename_keeps_target() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/dst").unwrap();
        vol.write("/dst", b"keep me", 0).unwrap();
        vol.flush("/dst").unwrap();

        assert!(matches!(
            vol.rename("/missing", "/dst"),
            Err(VolumeError::Io { .. })
        ));
        assert!(vol.is_encrypted("/dst"));
        assert!(dir.path().join("dst").is_dir());
        assert_eq!(vol.read("/dst", 0, 10).unwrap(), b"keep me");
    }

    #[test]
    fn test_rename_directory_over_encrypted_file_is_refused() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        fs::create_dir(dir.path().join("d")).unwrap();
        vol.create_file("/f").unwrap();

        assert!(vol.rename("/d", "/f").is_err());
        assert!(vol.is_encrypted("/f"));
        assert!(dir.path().join("d").is_dir());
    }

    #[test]
    fn test_oversized_write_is_refused() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a").unwrap();

        assert!(matches!(
            vol.write("/a", b"x", 1 << 50),
            Err(VolumeError::Cache(CacheError::Buffer(_)))
        ));
        assert!(matches!(
            vol.truncate("/a", 1 << 40),
            Err(VolumeError::Cache(CacheError::Buffer(_)))
        ));
        assert_eq!(vol.file_size("/a").unwrap(), 0);
    }

    #[test]
    fn test_rename_encrypted_over_encrypted() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/src").unwrap();
        vol.write("/src", b"source", 0).unwrap();
        vol.flush("/src").unwrap();
        vol.create_file("/dst").unwrap();
        vol.release("/dst");

        vol.rename("/src", "/dst").unwrap();
        assert!(!vol.is_encrypted("/src"));
        assert_eq!(vol.file_size("/dst").unwrap(), 6);
        assert_eq!(vol.read("/dst", 0, 6).unwrap(), b"source");
    }

    #[test]
    fn test_rename_directory_moves_records_and_entries() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        fs::create_dir(dir.path().join("a")).unwrap();
        vol.create_file("/a/x").unwrap();
        vol.create_file("/ab").unwrap();

        vol.rename("/a", "/b").unwrap();
        assert!(vol.is_encrypted("/b/x"));
        assert!(vol.is_encrypted("/ab"));
        assert!(vol.cache().is_open("/b/x"));
        assert!(!vol.cache().is_open("/a/x"));
        assert!(dir.path().join("b/x").is_dir());
    }

    #[test]
    fn test_rename_plain_file() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        fs::write(dir.path().join("p"), b"plain").unwrap();
        vol.rename("/p", "/q").unwrap();
        assert_eq!(fs::read(dir.path().join("q")).unwrap(), b"plain");
        assert!(!vol.is_encrypted("/q"));
    }

    #[test]
    fn test_set_times_on_closed_file() {
        let dir = TempDir::new().unwrap();
        let vol = volume(&dir);
        vol.create_file("/a").unwrap();
        vol.release("/a");
        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_234_567_890);

        vol.set_times("/a", Some(when), Some(when)).unwrap();
        let meta = fs::metadata(dir.path().join("a")).unwrap();
        assert_eq!(meta.modified().unwrap(), when);
    }
}
