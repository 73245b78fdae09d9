//! Test mount harness for FUSE integration tests.
//!
//! Provides `TestMount`, which mounts a fresh temporary data directory and
//! unmounts it on drop.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use freya_core::{KdfParams, MixSliceCodec, PassphraseEnvelope, Volume};
use freya_fuse::{FreyaFS, MountConfig};
use fuser::{BackgroundSession, MountOption};
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use zeroize::Zeroizing;

/// Passphrase of every test data directory.
pub const TEST_PASSWORD: &str = "freyafs-test";

/// How long to wait for mount to become ready.
const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait between mount readiness checks.
const MOUNT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Cheap scrypt cost so tests do not spend their time deriving keys.
const TEST_KDF: KdfParams = KdfParams {
    log_n: 4,
    r: 8,
    p: 1,
};

/// A mounted data directory for testing.
pub struct TestMount {
    /// The FUSE session (unmounts on drop).
    session: Option<BackgroundSession>,
    /// Path where the data directory is mounted.
    pub mount_path: PathBuf,
    /// Backing data directory.
    pub data: TempDir,
    _temp_mount: TempDir,
}

impl TestMount {
    /// Mount a fresh, empty data directory (single-threaded dispatch).
    pub fn with_temp_data() -> Result<Self, String> {
        let data = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        Self::mount(data, MountConfig::default())
    }

    /// Mount a fresh data directory served from a worker pool.
    pub fn with_temp_data_multithreaded() -> Result<Self, String> {
        let data = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        Self::mount(data, MountConfig::default().worker_threads(4))
    }

    /// Mount an existing data directory again, as after a restart.
    pub fn remount(mut self) -> Result<Self, String> {
        drop(self.session.take());
        thread::sleep(MOUNT_CHECK_INTERVAL);
        Self::mount(self.data, MountConfig::default())
    }

    fn mount(data: TempDir, config: MountConfig) -> Result<Self, String> {
        let temp_mount = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let mount_path = temp_mount.path().join("mnt");
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;

        let envelope = PassphraseEnvelope::new(Zeroizing::new(TEST_PASSWORD.to_string()), TEST_KDF);
        let volume = Volume::open(
            data.path(),
            &config.metadata_file_name,
            MixSliceCodec::new(),
            Box::new(envelope),
        )
        .map_err(|e| format!("Failed to open volume: {e}"))?;
        let fs = FreyaFS::new(Arc::new(volume), &config)
            .map_err(|e| format!("Failed to create FreyaFS: {e}"))?;

        let options = vec![
            MountOption::FSName("freyafs-test".to_string()),
            MountOption::AutoUnmount,
        ];
        let session = fuser::spawn_mount2(fs, &mount_path, &options)
            .map_err(|e| format!("Failed to mount: {e}"))?;

        Self::wait_for_mount(&mount_path)?;

        Ok(Self {
            session: Some(session),
            mount_path,
            data,
            _temp_mount: temp_mount,
        })
    }

    /// Wait until the mount point has a different device ID than its
    /// parent, which means the filesystem is mounted there.
    fn wait_for_mount(mount_path: &Path) -> Result<(), String> {
        use std::os::unix::fs::MetadataExt;

        let parent_path = mount_path.parent().ok_or("mount_path has no parent")?;
        let parent_dev = fs::metadata(parent_path)
            .map_err(|e| format!("Failed to stat parent: {e}"))?
            .dev();

        let deadline = Instant::now() + MOUNT_READY_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(mount_meta) = fs::metadata(mount_path)
                && mount_meta.dev() != parent_dev
            {
                return Ok(());
            }
            thread::sleep(MOUNT_CHECK_INTERVAL);
        }
        Err("Mount did not become ready in time (device ID unchanged)".to_string())
    }

    /// Build a full path from a relative path.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.mount_path.join(relative.trim_start_matches('/'))
    }

    /// Path of `relative` in the backing data directory.
    pub fn backing(&self, relative: &str) -> PathBuf {
        self.data.path().join(relative.trim_start_matches('/'))
    }

    pub fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut content = Vec::new();
        File::open(self.path(path))?.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Write content to a file (creates or overwrites).
    pub fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = File::create(self.path(path))?;
        file.write_all(content)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.path(path))
    }

    pub fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.path(path))
    }

    pub fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.path(from), self.path(to))
    }

    pub fn metadata(&self, path: &str) -> io::Result<Metadata> {
        fs::metadata(self.path(path))
    }

    /// Sorted names in a directory.
    pub fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.path(path))?
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(self.path(path))?;
        file.set_len(size)?;
        Ok(())
    }
}

/// Check if FUSE is available on this system.
pub fn fuse_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::harness::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}
