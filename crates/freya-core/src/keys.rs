//! Per-file key material.
//!
//! Every encrypted file has its own AES-128 key and 16-byte IV, generated
//! once when the file is created and kept in the metadata store for the
//! file's whole lifetime.

use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a per-file key in bytes.
pub const KEY_LEN: usize = 16;

/// Length of a per-file IV in bytes.
pub const IV_LEN: usize = 16;

macro_rules! secret_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Draw fresh bytes from the operating system CSPRNG.
            pub fn generate() -> Self {
                let mut bytes = [0u8; $len];
                rand::rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "([REDACTED])"))
            }
        }
    };
}

secret_bytes!(
    /// AES-128 key of one encrypted file.
    FileKey,
    KEY_LEN
);

secret_bytes!(
    /// Initial counter block of one encrypted file.
    FileIv,
    IV_LEN
);
