//! FUSE filesystem implementation for FreyaFS data directories.
//!
//! This module implements the fuser `Filesystem` trait on top of a shared
//! [`Volume`]. Encrypted files (paths with a metadata record) are served from
//! the volume's plaintext cache; everything else in the data directory is
//! passed through with `std::fs`.

use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use crate::executor::{SubmitError, WorkerPool};
use crate::handles::{FreyaHandle, FreyaHandleTable};
use crate::inode::{InodeTable, ROOT_INODE};

use freya_core::{Volume, path};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

/// Block size for filesystem statistics.
const BLOCK_SIZE: u32 = 4096;

/// `renameat2` flag refusing to replace an existing target.
const RENAME_NOREPLACE: u32 = 1;

fn errno(code: c_int) -> FuseError {
    FuseError::Io(io::Error::from_raw_os_error(code))
}

fn to_offset(offset: i64) -> FuseResult<u64> {
    u64::try_from(offset).map_err(|_| errno(libc::EINVAL))
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    match (u64::try_from(secs), u32::try_from(nsecs)) {
        (Ok(secs), Ok(nsecs)) => UNIX_EPOCH + Duration::new(secs, nsecs),
        _ => UNIX_EPOCH,
    }
}

fn file_type(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else {
        FileType::RegularFile
    }
}

/// Attributes of a passthrough entry, straight from the backing file.
#[allow(clippy::cast_possible_truncation)]
fn passthrough_attr(ino: u64, meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: file_type(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// Attributes of an encrypted file, whose backing path is a fragment
/// directory. Size comes from the metadata store.
fn encrypted_attr(ino: u64, dir_meta: &fs::Metadata, size: u64) -> FileAttr {
    let mut attr = passthrough_attr(ino, dir_meta);
    attr.kind = FileType::RegularFile;
    attr.size = size;
    attr.blocks = size.div_ceil(512);
    attr.perm &= !0o111;
    attr.nlink = 1;
    attr
}

/// Attributes of an open file that was unlinked or replaced. It has no
/// backing path: ownership and times come from the data root, and the link
/// count is zero.
fn detached_attr(ino: u64, root_meta: &fs::Metadata, size: u64) -> FileAttr {
    let mut attr = encrypted_attr(ino, root_meta, size);
    attr.nlink = 0;
    attr
}

/// Mode for the fragment directory of an encrypted file with file mode
/// `mode`: every read bit also grants search.
fn fragment_dir_mode(mode: u32) -> u32 {
    let mode = mode & 0o666;
    mode | ((mode & 0o444) >> 2)
}

fn open_options(flags: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => opts.write(true),
        libc::O_RDWR => opts.read(true).write(true),
        _ => opts.read(true),
    };
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    opts.custom_flags(flags & libc::O_NOFOLLOW);
    opts
}

fn wants_write(flags: i32) -> bool {
    matches!(flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR) || flags & libc::O_TRUNC != 0
}

fn read_fully_at(file: &File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Requested attribute changes of a `setattr` call.
#[derive(Debug, Default)]
struct AttrChanges {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
}

/// State shared between the FUSE session thread and pool workers.
struct FsCore {
    volume: Arc<Volume>,
    inodes: InodeTable,
    handles: FreyaHandleTable,
    ttl: Duration,
    read_only: bool,
}

impl FsCore {
    fn check_writable(&self) -> FuseResult<()> {
        if self.read_only {
            return Err(FuseError::ReadOnly);
        }
        Ok(())
    }

    fn path(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or(FuseError::InvalidInode(ino))
    }

    /// Logical path of `name` inside the directory `parent`.
    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name.to_str().ok_or(FuseError::InvalidName)?;
        let parent_path = self.path(parent)?;
        if self.volume.is_encrypted(&parent_path) {
            return Err(errno(libc::ENOTDIR));
        }
        Ok(path::join(&parent_path, name))
    }

    /// Whether `logical` exists for the mount. The metadata file does not.
    fn visible_metadata(&self, logical: &str) -> FuseResult<fs::Metadata> {
        if self.volume.is_metadata_file(logical) {
            return Err(errno(libc::ENOENT));
        }
        Ok(fs::symlink_metadata(self.volume.physical(logical))?)
    }

    fn attr(&self, ino: u64, logical: &str) -> FuseResult<FileAttr> {
        if self.volume.is_detached(logical) {
            let root_meta = fs::metadata(self.volume.root())?;
            let size = self.volume.file_size(logical)?;
            return Ok(detached_attr(ino, &root_meta, size));
        }
        let meta = self.visible_metadata(logical)?;
        if self.volume.is_encrypted(logical) {
            let size = self.volume.file_size(logical)?;
            Ok(encrypted_attr(ino, &meta, size))
        } else {
            Ok(passthrough_attr(ino, &meta))
        }
    }

    /// Attributes of a freshly resolved child, counting one kernel lookup.
    fn entry(&self, logical: &str) -> FuseResult<FileAttr> {
        self.visible_metadata(logical)?;
        let ino = self.inodes.get_or_insert(logical);
        self.attr(ino, logical)
    }

    fn lookup(&self, parent: u64, name: &OsStr) -> FuseResult<FileAttr> {
        let logical = self.child_path(parent, name)?;
        self.entry(&logical)
    }

    fn setattr(&self, ino: u64, fh: Option<u64>, changes: &AttrChanges) -> FuseResult<FileAttr> {
        self.check_writable()?;
        let logical = self.path(ino)?;
        if self.volume.is_detached(&logical) {
            return self.setattr_detached(ino, &logical, changes);
        }
        let physical = self.volume.physical(&logical);
        let encrypted = self.volume.is_encrypted(&logical);

        if let Some(mode) = changes.mode {
            let mode = if encrypted {
                fragment_dir_mode(mode)
            } else {
                mode & 0o7777
            };
            fs::set_permissions(&physical, Permissions::from_mode(mode))?;
        }

        if changes.uid.is_some() || changes.gid.is_some() {
            std::os::unix::fs::lchown(&physical, changes.uid, changes.gid)?;
        }

        if let Some(size) = changes.size {
            if encrypted {
                self.volume.truncate(&logical, size)?;
            } else {
                self.truncate_passthrough(fh, &physical, size)?;
            }
        }

        if changes.atime.is_some() || changes.mtime.is_some() {
            if encrypted {
                self.volume.set_times(&logical, changes.atime, changes.mtime)?;
            } else {
                if let Some(atime) = changes.atime {
                    filetime::set_file_atime(&physical, filetime::FileTime::from_system_time(atime))?;
                }
                if let Some(mtime) = changes.mtime {
                    filetime::set_file_mtime(&physical, filetime::FileTime::from_system_time(mtime))?;
                }
            }
        }

        self.attr(ino, &logical)
    }

    /// Only size and times apply to a detached file; it has no backing path
    /// to carry mode or ownership.
    fn setattr_detached(
        &self,
        ino: u64,
        logical: &str,
        changes: &AttrChanges,
    ) -> FuseResult<FileAttr> {
        if let Some(size) = changes.size {
            self.volume.truncate(logical, size)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            self.volume.set_times(logical, changes.atime, changes.mtime)?;
        }
        self.attr(ino, logical)
    }

    fn truncate_passthrough(&self, fh: Option<u64>, physical: &Path, size: u64) -> FuseResult<()> {
        if let Some(fh) = fh
            && let Some(handle) = self.handles.get(fh)
            && let Some(file) = handle.as_file()
        {
            file.set_len(size)?;
            return Ok(());
        }
        OpenOptions::new().write(true).open(physical)?.set_len(size)?;
        Ok(())
    }

    fn open(&self, ino: u64, flags: i32) -> FuseResult<u64> {
        if wants_write(flags) {
            self.check_writable()?;
        }
        let logical = self.path(ino)?;

        if self.volume.is_encrypted(&logical) {
            self.volume.open_file(&logical)?;
            return Ok(self.handles.insert(FreyaHandle::Encrypted { ino }));
        }

        let meta = self.visible_metadata(&logical)?;
        if meta.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        let file = open_options(flags).open(self.volume.physical(&logical))?;
        Ok(self.handles.insert(FreyaHandle::Passthrough(file)))
    }

    fn create(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> FuseResult<(FileAttr, u64)> {
        self.check_writable()?;
        let logical = self.child_path(parent, name)?;
        if fs::symlink_metadata(self.volume.physical(&logical)).is_ok() {
            return Err(FuseError::AlreadyExists(logical));
        }

        self.volume.create_file(&logical)?;
        let physical = self.volume.physical(&logical);
        if let Err(e) = fs::set_permissions(&physical, Permissions::from_mode(fragment_dir_mode(mode & !umask))) {
            warn!(path = %logical, error = %e, "Failed to apply mode to new file");
        }

        let ino = self.inodes.get_or_insert(&logical);
        let fh = self.handles.insert(FreyaHandle::Encrypted { ino });
        match self.attr(ino, &logical) {
            Ok(attr) => Ok((attr, fh)),
            Err(e) => {
                self.handles.remove(fh);
                self.volume.release(&logical);
                Err(e)
            }
        }
    }

    fn read(&self, fh: u64, offset: u64, size: usize) -> FuseResult<Vec<u8>> {
        let handle = self.handles.get(fh).ok_or(FuseError::InvalidHandle(fh))?;
        match handle.encrypted_ino() {
            Some(ino) => {
                drop(handle);
                let logical = self.path(ino)?;
                Ok(self.volume.read(&logical, offset, size)?)
            }
            None => {
                let file = handle.as_file().ok_or(FuseError::InvalidHandle(fh))?;
                Ok(read_fully_at(file, offset, size)?)
            }
        }
    }

    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FuseResult<usize> {
        self.check_writable()?;
        let handle = self.handles.get(fh).ok_or(FuseError::InvalidHandle(fh))?;
        match handle.encrypted_ino() {
            Some(ino) => {
                drop(handle);
                let logical = self.path(ino)?;
                Ok(self.volume.write(&logical, data, offset)?)
            }
            None => {
                let file = handle.as_file().ok_or(FuseError::InvalidHandle(fh))?;
                file.write_all_at(data, offset)?;
                Ok(data.len())
            }
        }
    }

    /// Write an encrypted handle's file back; passthrough files are synced
    /// only when `sync` asks for it.
    fn flush(&self, fh: u64, sync: Option<bool>) -> FuseResult<()> {
        let handle = self.handles.get(fh).ok_or(FuseError::InvalidHandle(fh))?;
        match handle.encrypted_ino() {
            Some(ino) => {
                drop(handle);
                let logical = self.path(ino)?;
                let outcome = self.volume.flush(&logical)?;
                trace!(path = %logical, ?outcome, "flushed");
                Ok(())
            }
            None => {
                let file = handle.as_file().ok_or(FuseError::InvalidHandle(fh))?;
                match sync {
                    Some(true) => file.sync_data()?,
                    Some(false) => file.sync_all()?,
                    None => {}
                }
                Ok(())
            }
        }
    }

    fn release(&self, fh: u64) -> FuseResult<()> {
        let handle = self.handles.remove(fh).ok_or(FuseError::InvalidHandle(fh))?;
        if let Some(ino) = handle.encrypted_ino() {
            let logical = self.path(ino)?;
            let remaining = self.volume.release(&logical);
            trace!(path = %logical, ?remaining, "released");
        }
        Ok(())
    }

    fn mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> FuseResult<FileAttr> {
        self.check_writable()?;
        let logical = self.child_path(parent, name)?;
        if self.volume.is_metadata_file(&logical) {
            return Err(errno(libc::EACCES));
        }
        fs::DirBuilder::new()
            .mode(mode & !umask & 0o7777)
            .create(self.volume.physical(&logical))?;
        self.entry(&logical)
    }

    fn symlink(&self, parent: u64, name: &OsStr, target: &Path) -> FuseResult<FileAttr> {
        self.check_writable()?;
        let logical = self.child_path(parent, name)?;
        if self.volume.is_metadata_file(&logical) {
            return Err(errno(libc::EACCES));
        }
        std::os::unix::fs::symlink(target, self.volume.physical(&logical))?;
        self.entry(&logical)
    }

    fn readlink(&self, ino: u64) -> FuseResult<Vec<u8>> {
        let logical = self.path(ino)?;
        if self.volume.is_encrypted(&logical) {
            return Err(errno(libc::EINVAL));
        }
        let target = fs::read_link(self.volume.physical(&logical))?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    fn unlink(&self, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.check_writable()?;
        let logical = self.child_path(parent, name)?;
        let meta = self.visible_metadata(&logical)?;
        if meta.is_dir() && !self.volume.is_encrypted(&logical) {
            return Err(errno(libc::EISDIR));
        }
        match self.volume.unlink(&logical)? {
            Some(key) => self.inodes.detach(&logical, &key),
            None => self.inodes.invalidate_path(&logical),
        }
        Ok(())
    }

    fn rmdir(&self, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.check_writable()?;
        let logical = self.child_path(parent, name)?;
        if self.volume.is_encrypted(&logical) {
            return Err(errno(libc::ENOTDIR));
        }
        fs::remove_dir(self.volume.physical(&logical))?;
        self.inodes.invalidate_path(&logical);
        Ok(())
    }

    fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> FuseResult<()> {
        self.check_writable()?;
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(errno(libc::EINVAL));
        }
        let old = self.child_path(parent, name)?;
        let new = self.child_path(newparent, newname)?;

        let meta = self.visible_metadata(&old)?;
        let target = self.visible_metadata(&new);
        if flags & RENAME_NOREPLACE != 0 && target.is_ok() {
            return Err(FuseError::AlreadyExists(new));
        }
        let moves_directory = meta.is_dir() && !self.volume.is_encrypted(&old);
        if let Ok(target) = &target {
            let target_is_dir = target.is_dir() && !self.volume.is_encrypted(&new);
            if moves_directory && !target_is_dir {
                return Err(errno(libc::ENOTDIR));
            }
            if !moves_directory && target_is_dir {
                return Err(errno(libc::EISDIR));
            }
        }

        if let Some(key) = self.volume.rename(&old, &new)? {
            self.inodes.detach(&new, &key);
        }
        self.inodes.rename(&old, &new);
        if moves_directory {
            self.inodes.rename_prefix(&old, &new);
        }
        Ok(())
    }

    fn check_directory(&self, ino: u64) -> FuseResult<String> {
        let logical = self.path(ino)?;
        if self.volume.is_encrypted(&logical) || !self.visible_metadata(&logical)?.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        Ok(logical)
    }

    /// Directory listing, sorted by name so offsets stay stable between
    /// calls, without the metadata file.
    fn list_directory(&self, logical: &str) -> FuseResult<Vec<(String, FileType)>> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(self.volume.physical(logical))? {
            let dirent = dirent?;
            let Some(name) = dirent.file_name().to_str().map(str::to_string) else {
                debug!(dir = logical, "Skipping entry with non UTF-8 name");
                continue;
            };
            let child = path::join(logical, &name);
            if self.volume.is_metadata_file(&child) {
                continue;
            }
            let kind = if self.volume.is_encrypted(&child) {
                FileType::RegularFile
            } else {
                file_type(dirent.file_type()?)
            };
            entries.push((name, kind));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

/// FUSE filesystem for a FreyaFS data directory.
///
/// In multi-threaded mode, content callbacks are run on a bounded worker
/// pool; directory and attribute callbacks stay on the session thread.
pub struct FreyaFS {
    core: Arc<FsCore>,
    pool: Option<WorkerPool>,
}

impl std::fmt::Debug for FreyaFS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreyaFS")
            .field("volume", &self.core.volume)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl FreyaFS {
    /// Creates the filesystem for `volume`.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker threads cannot be started.
    pub fn new(volume: Arc<Volume>, config: &MountConfig) -> io::Result<Self> {
        let pool = if config.is_multithreaded() {
            Some(WorkerPool::new(config.worker_threads, config.queue_capacity)?)
        } else {
            None
        };

        info!(
            root = %volume.root().display(),
            worker_threads = config.worker_threads,
            read_only = config.read_only,
            "FreyaFS initialized"
        );

        Ok(Self {
            core: Arc::new(FsCore {
                volume,
                inodes: InodeTable::new(),
                handles: FreyaHandleTable::new(),
                ttl: config.attr_ttl,
                read_only: config.read_only,
            }),
            pool,
        })
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.core.volume
    }

    /// Runs `job` inline, or on the pool in multi-threaded mode. The job is
    /// told whether it was admitted so it can reply with the error.
    fn dispatch<F>(&self, job: F)
    where
        F: FnOnce(&FsCore, Result<(), SubmitError>) + Send + 'static,
    {
        match &self.pool {
            None => job(&self.core, Ok(())),
            Some(pool) => {
                let core = Arc::clone(&self.core);
                pool.submit(move |admitted| job(&core, admitted));
            }
        }
    }
}

impl Filesystem for FreyaFS {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        info!(root = %self.core.volume.root().display(), "FUSE filesystem initialized");
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
        info!(
            open_files = self.core.volume.cache().len(),
            "FUSE filesystem destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        match self.core.lookup(parent, name) {
            Ok(attr) => reply.entry(&self.core.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.core.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.core.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        let result = self
            .core
            .path(ino)
            .and_then(|logical| self.core.attr(ino, &logical));
        match result {
            Ok(attr) => reply.attr(&self.core.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?mode, ?size, "setattr");
        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        };

        // a size change may decrypt and re-encrypt the whole file
        if size.is_some() {
            self.dispatch(move |core, admitted| {
                match admitted.map_err(FuseError::from).and_then(|()| core.setattr(ino, fh, &changes)) {
                    Ok(attr) => reply.attr(&core.ttl, &attr),
                    Err(e) => reply.error(e.to_errno()),
                }
            });
            return;
        }

        match self.core.setattr(ino, fh, &changes) {
            Ok(attr) => reply.attr(&self.core.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        match self.core.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?name, mode, "mkdir");
        match self.core.mkdir(parent, name, mode, umask) {
            Ok(attr) => reply.entry(&self.core.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "unlink");
        match self.core.unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "rmdir");
        match self.core.rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?link_name, target = %target.display(), "symlink");
        match self.core.symlink(parent, link_name, target) {
            Ok(attr) => reply.entry(&self.core.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, name = ?name, newparent, newname = ?newname, "rename");
        match self.core.rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        self.dispatch(move |core, admitted| {
            match admitted.map_err(FuseError::from).and_then(|()| core.open(ino, flags)) {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        self.dispatch(move |core, admitted| {
            let result = admitted
                .map_err(FuseError::from)
                .and_then(|()| to_offset(offset))
                .and_then(|offset| core.read(fh, offset, size as usize));
            match result {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, len = data.len(), "write");
        let data = data.to_vec();
        self.dispatch(move |core, admitted| {
            let result = admitted
                .map_err(FuseError::from)
                .and_then(|()| to_offset(offset))
                .and_then(|offset| core.write(fh, offset, &data))
                .and_then(|written| u32::try_from(written).map_err(|_| errno(libc::EOVERFLOW)));
            match result {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        self.dispatch(move |core, admitted| {
            match admitted.map_err(FuseError::from).and_then(|()| core.flush(fh, None)) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, datasync, "fsync");
        self.dispatch(move |core, admitted| {
            match admitted
                .map_err(FuseError::from)
                .and_then(|()| core.flush(fh, Some(datasync)))
            {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        self.dispatch(move |core, admitted| {
            match admitted.map_err(FuseError::from).and_then(|()| core.release(fh)) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        match self.core.check_directory(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, offset, "readdir");

        let logical = match self.core.check_directory(ino) {
            Ok(logical) => logical,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let entries = match self.core.list_directory(&logical) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_inode = if logical == path::ROOT {
            ROOT_INODE
        } else {
            self.core
                .inodes
                .get_inode(path::parent(&logical))
                .unwrap_or(ROOT_INODE)
        };

        let mut all_entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_inode, FileType::Directory, "..".to_string()),
        ];
        for (name, kind) in entries {
            let child = path::join(&logical, &name);
            let child_ino = self.core.inodes.get_or_insert(&child);
            all_entries.push((child_ino, kind, name));
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in all_entries.iter().enumerate().skip(skip) {
            // buffer.add returns true if buffer is full
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    #[allow(clippy::cast_possible_truncation, clippy::unnecessary_cast)]
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        trace!("statfs");
        match nix::sys::statvfs::statvfs(self.core.volume.root()) {
            Ok(stat) => {
                reply.statfs(
                    stat.blocks() as u64,
                    stat.blocks_free() as u64,
                    stat.blocks_available() as u64,
                    stat.files() as u64,
                    stat.files_free() as u64,
                    stat.block_size() as u32,
                    stat.name_max() as u32,
                    stat.fragment_size() as u32,
                );
            }
            Err(e) => {
                debug!(error = %e, "Failed to get statfs, using defaults");
                reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
            }
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(inode = ino, mask, "access");
        // permission bits are checked by the kernel (default_permissions)
        let result = self
            .core
            .path(ino)
            .and_then(|logical| self.core.visible_metadata(&logical).map(|_| ()));
        match result {
            Ok(()) if mask & libc::W_OK != 0 && self.core.read_only => reply.error(libc::EROFS),
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, name = ?name, mode, "create");
        let name = name.to_os_string();
        self.dispatch(move |core, admitted| {
            match admitted
                .map_err(FuseError::from)
                .and_then(|()| core.create(parent, &name, mode, umask))
            {
                Ok((attr, fh)) => reply.created(&core.ttl, &attr, 0, fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }
}
