//! freyafs - Mount a Mix&Slice encrypted data directory.
//!
//! Usage: freyafs <MOUNT> <DATA> [-t] [--read-only]

// Disable with `--no-default-features` if debugging allocator issues.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use freya_core::{MixSliceCodec, PassphraseEnvelope, Volume};
use freya_fuse::{FreyaFS, MountConfig};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "freyafs")]
#[command(about = "Mount a Mix&Slice encrypted directory as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Mountpoint for the filesystem
    mount: PathBuf,

    /// Directory holding the encrypted data
    data: PathBuf,

    /// Serve file content operations from a worker pool (one thread per CPU)
    #[arg(short = 't', long)]
    multithread: bool,

    /// Number of worker threads (implies --multithread)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Mount as read-only (default: read-write)
    #[arg(long)]
    read_only: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Read the passphrase from stdin (single line)
    #[arg(long)]
    password_stdin: bool,
}

impl Cli {
    fn mount_config(&self) -> MountConfig {
        let config = match self.threads {
            Some(threads) => MountConfig::default().worker_threads(threads),
            None if self.multithread => MountConfig::multithreaded(),
            None => MountConfig::default(),
        };
        config.read_only(self.read_only)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if !cli.data.is_dir() {
        anyhow::bail!("Data directory does not exist: {}", cli.data.display());
    }
    if !cli.mount.exists() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mount.display());
    }

    let config = cli.mount_config();
    let is_new = !cli.data.join(&config.metadata_file_name).exists();
    let password = get_password(&cli, is_new)?;

    info!(data = %cli.data.display(), mount = %cli.mount.display(), "Mounting data directory");

    let envelope = PassphraseEnvelope::new(password, config.kdf);
    let volume = Volume::open(
        &cli.data,
        &config.metadata_file_name,
        MixSliceCodec::new(),
        Box::new(envelope),
    )
    .context("Failed to open data directory (wrong passphrase?)")?;

    let fs = FreyaFS::new(Arc::new(volume), &config).context("Failed to initialize filesystem")?;

    mount_and_wait(&cli, &config, fs)
}

/// Get the passphrase from stdin, `FREYAFS_PASSWORD`, or a prompt.
///
/// A new store asks twice, so a typo does not lock the data away.
fn get_password(cli: &Cli, is_new: bool) -> Result<Zeroizing<String>> {
    if cli.password_stdin {
        return read_password_from_stdin();
    }
    if let Ok(pwd) = std::env::var("FREYAFS_PASSWORD") {
        return Ok(Zeroizing::new(pwd));
    }

    let password = Zeroizing::new(
        rpassword::prompt_password("Passphrase: ").context("Failed to read passphrase")?,
    );
    if is_new {
        let confirm = Zeroizing::new(
            rpassword::prompt_password("Confirm passphrase: ")
                .context("Failed to read passphrase")?,
        );
        if *password != *confirm {
            anyhow::bail!("Passphrases do not match");
        }
    }
    Ok(password)
}

fn read_password_from_stdin() -> Result<Zeroizing<String>> {
    if io::stdin().is_terminal() {
        anyhow::bail!(
            "--password-stdin requires the passphrase to be piped in.\n\
             Example: echo \"$SECRET\" | freyafs --password-stdin <MOUNT> <DATA>"
        );
    }

    let mut line = Zeroizing::new(String::new());
    io::stdin().read_line(&mut line)?;
    let password = line.trim_end_matches('\n').trim_end_matches('\r');
    if password.is_empty() {
        anyhow::bail!("Passphrase from stdin is empty");
    }
    Ok(Zeroizing::new(password.to_string()))
}

fn data_name(data: &Path) -> String {
    data.canonicalize()
        .ok()
        .as_deref()
        .and_then(Path::file_name)
        .map_or_else(|| "data".to_string(), |n| n.to_string_lossy().to_string())
}

/// Mount the filesystem and wait for Ctrl+C.
fn mount_and_wait(cli: &Cli, config: &MountConfig, fs: FreyaFS) -> Result<()> {
    let name = data_name(&cli.data);

    let mut options = vec![
        fuser::MountOption::FSName(format!("freyafs:{name}")),
        fuser::MountOption::Subtype("freyafs".to_string()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];

    #[cfg(target_os = "macos")]
    options.push(fuser::MountOption::CUSTOM(format!("volname={name}")));

    if config.read_only {
        options.push(fuser::MountOption::RO);
    } else {
        options.push(fuser::MountOption::RW);
    }

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!("Mounting filesystem (press Ctrl+C to unmount)");

    let session = fuser::spawn_mount2(fs, &cli.mount, &options).map_err(|e| {
        error!(error = %e, "Mount failed");
        anyhow::anyhow!("Failed to mount filesystem: {e}")
    })?;

    info!("Filesystem mounted at {}", cli.mount.display());

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    drop(session);
    info!("Filesystem unmounted");
    Ok(())
}
