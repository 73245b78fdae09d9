//! Durable per-file encryption parameters.
//!
//! [`MetadataStore`] maps every encrypted logical path to its key, IV and the
//! last known plaintext size. It is the only place keys live, so every
//! mutation is written through to disk before the mutating call returns.
//!
//! # Persistence
//!
//! The whole map is serialized as one JSON document,
//! `{ "<path>": { "key": b64, "iv": b64, "size": n }, ... }`, wrapped by an
//! [`Envelope`] and written over the previous file through a temporary file
//! and an atomic rename.
//!
//! # Concurrency
//!
//! The in-memory map sits behind a single lock held only while the map is
//! read or changed. Dumps are serialized by a second lock; each mutation
//! bumps a generation counter so a dump holding an older snapshot never
//! replaces a newer file.

use crate::envelope::{Envelope, EnvelopeError};
use crate::keys::{FileIv, FileKey, IV_LEN, KEY_LEN};
use crate::path;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

/// Errors from [`MetadataStore`] operations.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("No metadata record for {path}")]
    NotFound { path: String },

    #[error("Metadata record already exists for {path}")]
    AlreadyExists { path: String },

    #[error("Metadata file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("Metadata document is malformed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl MetadataError {
    fn not_found(path: &str) -> Self {
        MetadataError::NotFound {
            path: path.to_string(),
        }
    }
}

/// Encryption parameters of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub path: String,
    pub key: FileKey,
    pub iv: FileIv,
    /// Plaintext size, kept so attribute queries never need a decrypt.
    pub size: u64,
}

#[derive(Clone)]
struct Entry {
    key: FileKey,
    iv: FileIv,
    size: u64,
}

#[serde_as]
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    #[serde_as(as = "Base64")]
    key: [u8; KEY_LEN],
    #[serde_as(as = "Base64")]
    iv: [u8; IV_LEN],
    size: u64,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<String, Entry>,
    generation: u64,
}

/// Path-keyed store of [`MetadataRecord`]s, persisted on every mutation.
pub struct MetadataStore {
    file: PathBuf,
    envelope: Box<dyn Envelope>,
    state: Mutex<StoreState>,
    /// Generation of the snapshot currently on disk.
    persisted: Mutex<u64>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("file", &self.file)
            .field("envelope", &self.envelope)
            .field("records", &self.len())
            .finish()
    }
}

impl MetadataStore {
    /// Load the store at `file`, or start empty if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read, unwrapped (wrong
    /// passphrase) or parsed.
    pub fn open(
        file: impl Into<PathBuf>,
        envelope: Box<dyn Envelope>,
    ) -> Result<Self, MetadataError> {
        let file = file.into();
        let records = match fs::read(&file) {
            Ok(sealed) => {
                let document = envelope.open(&sealed)?;
                let stored: BTreeMap<String, StoredRecord> = serde_json::from_slice(&document)?;
                stored
                    .into_iter()
                    .map(|(path, r)| {
                        let entry = Entry {
                            key: FileKey::from_bytes(r.key),
                            iv: FileIv::from_bytes(r.iv),
                            size: r.size,
                        };
                        (path, entry)
                    })
                    .collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(file = %file.display(), "No metadata file yet, starting empty store");
                HashMap::new()
            }
            Err(source) => return Err(MetadataError::Io { path: file, source }),
        };

        info!(file = %file.display(), records = records.len(), "Loaded metadata store");
        Ok(Self {
            file,
            envelope,
            state: Mutex::new(StoreState {
                records,
                generation: 0,
            }),
            persisted: Mutex::new(0),
        })
    }

    /// Location of the persisted document.
    pub fn file_path(&self) -> &Path {
        &self.file
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().records.contains_key(path)
    }

    /// Look up the record for `path`.
    pub fn get(&self, path: &str) -> Result<MetadataRecord, MetadataError> {
        let state = self.state.lock();
        let entry = state
            .records
            .get(path)
            .ok_or_else(|| MetadataError::not_found(path))?;
        Ok(MetadataRecord {
            path: path.to_string(),
            key: entry.key.clone(),
            iv: entry.iv.clone(),
            size: entry.size,
        })
    }

    /// Register a new encrypted file with a fresh random key and IV.
    ///
    /// # Errors
    ///
    /// [`MetadataError::AlreadyExists`] if `path` already has a record; an
    /// existing key is never replaced, since that would make the file's
    /// current fragments undecryptable.
    pub fn add(&self, path: &str) -> Result<(FileKey, FileIv), MetadataError> {
        let key = FileKey::generate();
        let iv = FileIv::generate();
        {
            let mut state = self.state.lock();
            if state.records.contains_key(path) {
                return Err(MetadataError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            state.records.insert(
                path.to_string(),
                Entry {
                    key: key.clone(),
                    iv: iv.clone(),
                    size: 0,
                },
            );
            state.generation += 1;
        }
        debug!(path, "Added metadata record");
        self.dump()?;
        Ok((key, iv))
    }

    /// Record a new plaintext size. Unchanged sizes are not persisted again.
    pub fn update(&self, path: &str, size: u64) -> Result<(), MetadataError> {
        {
            let mut state = self.state.lock();
            let entry = state
                .records
                .get_mut(path)
                .ok_or_else(|| MetadataError::not_found(path))?;
            if entry.size == size {
                return Ok(());
            }
            entry.size = size;
            state.generation += 1;
        }
        self.dump()
    }

    /// Move the record at `old` to `new`, replacing any record at `new`.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), MetadataError> {
        {
            let mut state = self.state.lock();
            let entry = state
                .records
                .remove(old)
                .ok_or_else(|| MetadataError::not_found(old))?;
            state.records.insert(new.to_string(), entry);
            state.generation += 1;
        }
        debug!(old, new, "Renamed metadata record");
        self.dump()
    }

    /// Rename every record at or below the directory `old_prefix`.
    ///
    /// Prefix matching is per path component, so renaming `/a` moves `/a/x`
    /// but leaves `/ab` and `/c/a` alone.
    ///
    /// # Returns
    ///
    /// The number of records moved. Nothing is persisted when it is zero.
    pub fn renamedir(&self, old_prefix: &str, new_prefix: &str) -> Result<usize, MetadataError> {
        let moved = {
            let mut state = self.state.lock();
            let affected: Vec<String> = state
                .records
                .keys()
                .filter(|p| path::is_under(p, old_prefix))
                .cloned()
                .collect();

            for old in &affected {
                if let Some(new) = path::rebase(old, old_prefix, new_prefix)
                    && let Some(entry) = state.records.remove(old)
                {
                    state.records.insert(new, entry);
                }
            }
            if !affected.is_empty() {
                state.generation += 1;
            }
            affected.len()
        };

        if moved == 0 {
            return Ok(0);
        }
        debug!(old_prefix, new_prefix, moved, "Renamed metadata directory");
        self.dump()?;
        Ok(moved)
    }

    /// Delete the record for `path`.
    ///
    /// # Returns
    ///
    /// `false` (and no write) if there was no record.
    pub fn remove(&self, path: &str) -> Result<bool, MetadataError> {
        {
            let mut state = self.state.lock();
            if state.records.remove(path).is_none() {
                return Ok(false);
            }
            state.generation += 1;
        }
        debug!(path, "Removed metadata record");
        self.dump()?;
        Ok(true)
    }

    /// Write the current map to disk, replacing the previous file.
    ///
    /// A failure leaves the in-memory state as it is; the next successful
    /// dump persists it.
    pub fn dump(&self) -> Result<(), MetadataError> {
        let (generation, document) = {
            let state = self.state.lock();
            let stored: BTreeMap<&str, StoredRecord> = state
                .records
                .iter()
                .map(|(path, e)| {
                    let record = StoredRecord {
                        key: *e.key.as_bytes(),
                        iv: *e.iv.as_bytes(),
                        size: e.size,
                    };
                    (path.as_str(), record)
                })
                .collect();
            (state.generation, Zeroizing::new(serde_json::to_vec(&stored)?))
        };

        let mut persisted = self.persisted.lock();
        if *persisted >= generation && self.file.exists() {
            return Ok(());
        }

        let sealed = self.envelope.seal(&document)?;
        self.write_atomically(&sealed).inspect_err(|e| {
            error!(file = %self.file.display(), error = %e, "Failed to persist metadata");
        })?;
        *persisted = generation;
        Ok(())
    }

    fn write_atomically(&self, data: &[u8]) -> Result<(), MetadataError> {
        let dir = match self.file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let io_err = |source: io::Error| MetadataError::Io {
            path: self.file.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(data).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.file).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}
