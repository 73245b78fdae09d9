//! FUSE filesystem for FreyaFS encrypted data directories.
//!
//! Mounting a data directory shows every encrypted file (a fragment
//! directory written by the Mix&Slice codec) as a plain regular file.
//! Content is decrypted once on open into a shared write-back cache and
//! re-encrypted on flush. Directories, symlinks and unencrypted files are
//! passed through unchanged.
//!
//! # Usage
//!
//! ```ignore
//! use freya_fuse::{FreyaFS, MountConfig};
//!
//! let volume = Arc::new(Volume::open(data_dir, ".freyafs", MixSliceCodec::new(), envelope)?);
//! let fs = FreyaFS::new(volume, &MountConfig::multithreaded())?;
//! fuser::spawn_mount2(fs, mountpoint, &options)?;
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod filesystem;
pub mod handles;
pub mod inode;

pub use config::MountConfig;
pub use error::{FuseError, FuseResult, ToErrno};
pub use executor::{SubmitError, WorkerPool};
pub use filesystem::FreyaFS;
pub use handles::{FreyaHandle, FreyaHandleTable};
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
