//! Codec boundary between plaintext and the on-disk fragment encoding.
//!
//! The cache treats the codec as opaque: it hands over the full plaintext of
//! a file together with the file's key and IV, and later asks for the
//! plaintext back. How the bytes are mixed, sliced and laid out on disk is
//! the codec's business.
//!
//! [`MixSliceCodec`] is the codec shipped with this crate.

mod mixslice;

pub use mixslice::{FRAGMENT_COUNT, MACRO_SIZE, MINI_PER_MACRO, MINI_SIZE, MixSliceCodec};

use crate::keys::{FileIv, FileKey};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while encoding or decoding a fragment set.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Filesystem I/O on the fragment directory failed.
    #[error("Fragment I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The fragment directory does not hold the fixed number of fragments.
    #[error("Expected {expected} fragments in {path}, found {actual}")]
    FragmentCount {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    /// Fragments have inconsistent or impossible lengths.
    #[error("Malformed fragment set in {path}: {reason}")]
    MalformedFragment { path: PathBuf, reason: String },

    /// The decoded plaintext does not end in valid padding.
    ///
    /// Usually a wrong key/IV pair, otherwise corrupted fragments.
    #[error("Invalid padding after decoding {path} (wrong key or corrupted fragments)")]
    Padding { path: PathBuf },
}

impl CodecError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        CodecError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Transforms plaintext to and from an encrypted representation at a path.
///
/// Implementations must be safe to call from several threads at once for
/// *different* paths. The cache serialises encodes of one path, and only
/// decodes a path while no entry for it is open.
pub trait Codec: Send + Sync {
    /// Encode `plaintext` and write the result at `path`, replacing whatever
    /// representation was there before.
    fn encrypt(
        &self,
        plaintext: &[u8],
        path: &Path,
        key: &FileKey,
        iv: &FileIv,
    ) -> Result<(), CodecError>;

    /// Read the representation at `path` and return the plaintext.
    fn decrypt(&self, path: &Path, key: &FileKey, iv: &FileIv) -> Result<Vec<u8>, CodecError>;
}

impl<C: Codec + ?Sized> Codec for Arc<C> {
    fn encrypt(
        &self,
        plaintext: &[u8],
        path: &Path,
        key: &FileKey,
        iv: &FileIv,
    ) -> Result<(), CodecError> {
        (**self).encrypt(plaintext, path, key, iv)
    }

    fn decrypt(&self, path: &Path, key: &FileKey, iv: &FileIv) -> Result<Vec<u8>, CodecError> {
        (**self).decrypt(path, key, iv)
    }
}
