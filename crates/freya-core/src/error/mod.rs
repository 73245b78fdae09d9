//! Error types for the freya-core crate
//!
//! Each module owns its error enum; this module collects them in one place.

pub use crate::buffer::BufferError;
pub use crate::cache::CacheError;
pub use crate::codec::CodecError;
pub use crate::envelope::EnvelopeError;
pub use crate::metadata::MetadataError;
pub use crate::volume::VolumeError;
