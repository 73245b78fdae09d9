//! Error handling and mapping for the FUSE filesystem.
//!
//! Every failure reaching a FUSE callback is turned into a POSIX errno here.

use crate::executor::SubmitError;
use freya_core::error::{
    BufferError, CacheError, CodecError, EnvelopeError, MetadataError, VolumeError,
};
use std::io;
use thiserror::Error;

/// FUSE-specific errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FuseError {
    /// Volume operation error (boxed to reduce enum size).
    #[error("Volume operation failed: {0}")]
    Volume(Box<VolumeError>),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid inode: {0}")]
    InvalidInode(u64),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Name is not valid UTF-8 and cannot be a logical path component.
    #[error("Invalid file name")]
    InvalidName,

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    /// Worker pool did not accept the request.
    #[error(transparent)]
    Rejected(#[from] SubmitError),

    #[error("Filesystem is read-only")]
    ReadOnly,
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Volume(e) => volume_error_to_errno(e.as_ref()),
            FuseError::Io(e) => io_error_to_errno(e),
            FuseError::InvalidInode(_) => libc::ENOENT,
            FuseError::InvalidHandle(_) => libc::EBADF,
            FuseError::InvalidName => libc::EINVAL,
            FuseError::AlreadyExists(_) => libc::EEXIST,
            FuseError::Rejected(e) => e.to_errno(),
            FuseError::ReadOnly => libc::EROFS,
        }
    }
}

/// Converts a volume error to a libc error code.
pub fn volume_error_to_errno(e: &VolumeError) -> i32 {
    match e {
        VolumeError::Metadata(e) => metadata_error_to_errno(e),
        VolumeError::Cache(CacheError::Codec(e)) => codec_error_to_errno(e),
        VolumeError::Cache(CacheError::Timestamps { source, .. }) => io_error_to_errno(source),
        VolumeError::Cache(CacheError::Buffer(BufferError::TooLarge { .. })) => libc::EFBIG,
        VolumeError::Cache(CacheError::Buffer(BufferError::OutOfMemory { .. })) => libc::ENOMEM,
        VolumeError::Io { source, .. } => io_error_to_errno(source),
        VolumeError::Protected { .. } => libc::EACCES,
        VolumeError::NotOpen { .. } => libc::EBADF,
        VolumeError::NotADirectory { .. } => libc::ENOTDIR,
    }
}

/// Converts a metadata store error to a libc error code.
///
/// Failures to persist the store surface as `EIO`: the caller must not
/// assume the change is durable.
pub fn metadata_error_to_errno(e: &MetadataError) -> i32 {
    match e {
        MetadataError::NotFound { .. } => libc::ENOENT,
        MetadataError::AlreadyExists { .. } => libc::EEXIST,
        MetadataError::Io { source, .. } => io_error_to_errno(source),
        MetadataError::Envelope(EnvelopeError::Authentication) => libc::EACCES,
        MetadataError::Envelope(_) | MetadataError::Serialize(_) => libc::EIO,
    }
}

/// Converts a codec error to a libc error code.
pub fn codec_error_to_errno(e: &CodecError) -> i32 {
    match e {
        CodecError::Io { source, .. } => io_error_to_errno(source),
        CodecError::FragmentCount { .. }
        | CodecError::MalformedFragment { .. }
        | CodecError::Padding { .. } => libc::EIO,
    }
}

/// Converts an IO error to a libc error code.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Result type for FUSE operations.
pub type FuseResult<T> = Result<T, FuseError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for VolumeError {
    fn to_errno(&self) -> i32 {
        volume_error_to_errno(self)
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

impl From<VolumeError> for FuseError {
    fn from(e: VolumeError) -> Self {
        FuseError::Volume(Box::new(e))
    }
}

impl From<MetadataError> for FuseError {
    fn from(e: MetadataError) -> Self {
        FuseError::Volume(Box::new(VolumeError::Metadata(e)))
    }
}
