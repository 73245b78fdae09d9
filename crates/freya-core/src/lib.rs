//! Core of FreyaFS: a write-back plaintext cache over a Mix&Slice encrypted
//! directory.
//!
//! - [`buffer`]: in-memory plaintext of one open file
//! - [`codec`]: plaintext to fragment-directory encoding
//! - [`metadata`]: durable per-file keys, IVs and sizes
//! - [`envelope`]: sealing of the metadata document
//! - [`cache`]: reference-counted, dirty-tracked open files
//! - [`volume`]: the operations a filesystem driver calls for encrypted paths

pub mod buffer;
pub mod cache;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod metadata;
pub mod path;
pub mod volume;

pub use buffer::ByteBuffer;
pub use cache::{FlushOutcome, PlaintextCache};
pub use codec::{Codec, MixSliceCodec};
pub use envelope::{Envelope, KdfParams, PassphraseEnvelope, PlainEnvelope};
pub use keys::{FileIv, FileKey};
pub use metadata::{MetadataRecord, MetadataStore};
pub use volume::{DEFAULT_METADATA_FILE, Volume};
