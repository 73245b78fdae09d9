//! Mount configuration for the FUSE filesystem.

use freya_core::{DEFAULT_METADATA_FILE, KdfParams};
use std::time::Duration;

/// Default time-to-live for attributes and entries handed to the kernel.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Default depth of the worker queue in multi-threaded mode.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration options for the FUSE filesystem.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Time-to-live for attributes and lookups.
    ///
    /// Kept short: sizes of encrypted files change with every write and the
    /// backing directory may be modified outside the mount.
    pub attr_ttl: Duration,

    /// Number of worker threads for file content operations.
    ///
    /// `0` serves every request on the FUSE session thread.
    pub worker_threads: usize,

    /// Maximum queued requests before callers get `EAGAIN`.
    pub queue_capacity: usize,

    /// Mount read-only.
    pub read_only: bool,

    /// Name of the metadata file inside the data directory.
    pub metadata_file_name: String,

    /// scrypt parameters for a newly created metadata store.
    pub kdf: KdfParams,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_TTL,
            worker_threads: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_only: false,
            metadata_file_name: DEFAULT_METADATA_FILE.to_string(),
            kdf: KdfParams::default(),
        }
    }
}

impl MountConfig {
    /// Multi-threaded configuration with one worker per CPU.
    pub fn multithreaded() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            ..Default::default()
        }
    }

    pub fn is_multithreaded(&self) -> bool {
        self.worker_threads > 0
    }

    /// Sets the cache TTL for attributes and entries.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the number of worker threads (`0` for single-threaded).
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets the worker queue depth.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn metadata_file_name(mut self, name: impl Into<String>) -> Self {
        self.metadata_file_name = name.into();
        self
    }

    #[must_use]
    pub fn kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_single_threaded() {
        let config = MountConfig::default();
        assert_eq!(config.attr_ttl, Duration::from_secs(1));
        assert_eq!(config.worker_threads, 0);
        assert!(!config.is_multithreaded());
        assert_eq!(config.queue_capacity, 1024);
        assert!(!config.read_only);
        assert_eq!(config.metadata_file_name, ".freyafs");
        assert_eq!(config.kdf, KdfParams::default());
    }

    #[test]
    fn test_multithreaded_uses_all_cpus() {
        let config = MountConfig::multithreaded();
        assert_eq!(config.worker_threads, num_cpus::get());
        assert!(config.is_multithreaded());
    }

    #[test]
    fn test_builder_pattern() {
        let config = MountConfig::default()
            .attr_ttl(Duration::from_millis(500))
            .worker_threads(4)
            .queue_capacity(16)
            .read_only(true)
            .metadata_file_name(".meta");
        assert_eq!(config.attr_ttl, Duration::from_millis(500));
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.queue_capacity, 16);
        assert!(config.read_only);
        assert_eq!(config.metadata_file_name, ".meta");
    }
}
