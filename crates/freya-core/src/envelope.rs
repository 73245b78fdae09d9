//! Wrapping of the serialized metadata document.
//!
//! The metadata file holds every per-file key, so it never hits the disk in
//! the clear unless the caller explicitly asks for a [`PlainEnvelope`].
//!
//! # Sealed format
//!
//! [`PassphraseEnvelope`] writes base64 of:
//!
//! ```text
//! version (1) | log_n (1) | r (4, BE) | p (4, BE) | salt (16) | nonce (12) | ciphertext + tag
//! ```
//!
//! The header (everything before the ciphertext) is bound as associated data,
//! so changing the KDF parameters or salt is detected as tampering.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = 1 + 1 + 4 + 4 + SALT_LEN + NONCE_LEN;

/// Errors from sealing or opening a metadata document.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Metadata file is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Metadata file is truncated: {len} bytes, header needs {HEADER_LEN}")]
    Truncated { len: usize },

    #[error("Unsupported metadata format version {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid scrypt parameters (N=2^{log_n}, r={r}, p={p})")]
    InvalidKdfParams { log_n: u8, r: u32, p: u32 },

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Wrong passphrase, or the file was modified.
    #[error("Metadata authentication failed (wrong passphrase or tampered file)")]
    Authentication,

    #[error("Metadata encryption failed")]
    Encryption,
}

/// scrypt cost parameters for deriving the metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// log2 of the CPU/memory cost `N`.
    pub log_n: u8,
    /// Block size.
    pub r: u32,
    /// Parallelization.
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            log_n: 15,
            r: 8,
            p: 1,
        }
    }
}

/// Wraps and unwraps the serialized metadata document.
pub trait Envelope: Send + Sync + fmt::Debug {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError>;

    fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, EnvelopeError>;
}

/// Identity envelope: the document is stored as plain JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainEnvelope;

impl Envelope for PlainEnvelope {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        Ok(Zeroizing::new(sealed.to_vec()))
    }
}

struct DerivedKey {
    params: KdfParams,
    salt: [u8; SALT_LEN],
    key: Zeroizing<[u8; KEY_LEN]>,
}

/// Passphrase-keyed AES-256-GCM envelope.
///
/// The scrypt derivation is expensive, so the derived key is cached and
/// reused for every seal. Opening a file written under a different salt or
/// parameter set re-derives once and adopts that salt for later seals.
pub struct PassphraseEnvelope {
    passphrase: Zeroizing<String>,
    params: KdfParams,
    derived: Mutex<Option<DerivedKey>>,
}

impl fmt::Debug for PassphraseEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassphraseEnvelope")
            .field("passphrase", &"[REDACTED]")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl PassphraseEnvelope {
    /// Create an envelope for `passphrase`.
    ///
    /// `params` only applies to stores sealed for the first time; existing
    /// files carry their own parameters in the header.
    pub fn new(passphrase: Zeroizing<String>, params: KdfParams) -> Self {
        Self {
            passphrase,
            params,
            derived: Mutex::new(None),
        }
    }

    fn derive(&self, params: KdfParams, salt: [u8; SALT_LEN]) -> Result<DerivedKey, EnvelopeError> {
        let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, KEY_LEN)
            .map_err(|_| EnvelopeError::InvalidKdfParams {
                log_n: params.log_n,
                r: params.r,
                p: params.p,
            })?;

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        scrypt::scrypt(
            self.passphrase.as_bytes(),
            &salt,
            &scrypt_params,
            &mut key[..],
        )
        .map_err(|e| EnvelopeError::KeyDerivation(e.to_string()))?;

        debug!(log_n = params.log_n, r = params.r, p = params.p, "Derived metadata key");
        Ok(DerivedKey { params, salt, key })
    }
}

fn header(params: KdfParams, salt: &[u8; SALT_LEN], nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.push(FORMAT_VERSION);
    out.push(params.log_n);
    out.extend_from_slice(&params.r.to_be_bytes());
    out.extend_from_slice(&params.p.to_be_bytes());
    out.extend_from_slice(salt);
    out.extend_from_slice(nonce);
    out
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

impl Envelope for PassphraseEnvelope {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let mut derived = self.derived.lock();
        if derived.is_none() {
            let mut salt = [0u8; SALT_LEN];
            rand::rng().fill_bytes(&mut salt);
            *derived = Some(self.derive(self.params, salt)?);
        }
        let Some(derived) = derived.as_ref() else {
            return Err(EnvelopeError::Encryption);
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let mut out = header(derived.params, &derived.salt, &nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived.key[..]));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &out,
                },
            )
            .map_err(|_| EnvelopeError::Encryption)?;
        out.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(out).into_bytes())
    }

    fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        let raw = BASE64.decode(sealed.trim_ascii())?;
        if raw.len() < HEADER_LEN {
            return Err(EnvelopeError::Truncated { len: raw.len() });
        }
        if raw[0] != FORMAT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(raw[0]));
        }

        let params = KdfParams {
            log_n: raw[1],
            r: be_u32(&raw[2..6]),
            p: be_u32(&raw[6..10]),
        };
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&raw[10..10 + SALT_LEN]);
        let (header_bytes, ciphertext) = raw.split_at(HEADER_LEN);
        let nonce = &header_bytes[10 + SALT_LEN..];

        let mut derived = self.derived.lock();
        let reusable = derived
            .as_ref()
            .is_some_and(|d| d.params == params && d.salt == salt);
        if !reusable {
            *derived = Some(self.derive(params, salt)?);
        }
        let Some(derived) = derived.as_ref() else {
            return Err(EnvelopeError::Authentication);
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived.key[..]));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header_bytes,
                },
            )
            .map_err(|_| {
                warn!("Metadata decryption failed - authentication tag mismatch");
                EnvelopeError::Authentication
            })?;

        Ok(Zeroizing::new(plaintext))
    }
}
