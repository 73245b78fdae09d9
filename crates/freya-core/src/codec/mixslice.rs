//! Fragment-directory codec in the Mix&Slice layout.
//!
//! # Layout
//!
//! The plaintext is padded to a whole number of macro blocks
//! (`MACRO_SIZE` = 1024 mini blocks of 4 bytes), mixed with AES-128-CTR
//! under the file's key and IV, and then sliced: fragment `j` holds mini
//! block `j` of every macro block, in order. The fragments are stored as
//! `frag_0000.dat` .. `frag_1023.dat` inside a directory that takes the
//! place of the file on disk.
//!
//! Padding is ISO/IEC 7816-4: a single `0x80` byte followed by zeros up to
//! the next macro boundary. There is always at least one padding byte, so
//! an empty file still encodes to one macro block.

use super::{Codec, CodecError};
use crate::keys::{FileIv, FileKey};
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Size of a mini block in bytes.
pub const MINI_SIZE: usize = 4;

/// Number of mini blocks per macro block.
pub const MINI_PER_MACRO: usize = 1024;

/// Size of a macro block in bytes.
pub const MACRO_SIZE: usize = MINI_SIZE * MINI_PER_MACRO;

/// Number of fragments every encoded file consists of.
pub const FRAGMENT_COUNT: usize = MINI_PER_MACRO;

const PAD_MARKER: u8 = 0x80;
const FRAGMENT_PREFIX: &str = "frag_";
const FRAGMENT_SUFFIX: &str = ".dat";

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// The Mix&Slice fragment codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct MixSliceCodec;

impl MixSliceCodec {
    pub fn new() -> Self {
        Self
    }
}

fn fragment_name(index: usize) -> String {
    let width = FRAGMENT_COUNT.to_string().len();
    format!("{FRAGMENT_PREFIX}{index:0width$}{FRAGMENT_SUFFIX}")
}

fn is_fragment_name(name: &str) -> bool {
    name.starts_with(FRAGMENT_PREFIX) && name.ends_with(FRAGMENT_SUFFIX)
}

fn pad(data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() / MACRO_SIZE + 1) * MACRO_SIZE;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(data);
    out.push(PAD_MARKER);
    out.resize(padded_len, 0);
    out
}

fn unpad(mut data: Vec<u8>) -> Option<Vec<u8>> {
    let marker = data.iter().rposition(|&b| b != 0)?;
    if data[marker] != PAD_MARKER || data.len() - marker > MACRO_SIZE {
        return None;
    }
    data.truncate(marker);
    Some(data)
}

fn mix(data: &mut [u8], key: &FileKey, iv: &FileIv) {
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(iv.as_bytes()),
    );
    cipher.apply_keystream(data);
}

fn slice(mixed: &[u8]) -> Vec<Vec<u8>> {
    let macros = mixed.len() / MACRO_SIZE;
    let mut fragments = vec![Vec::with_capacity(macros * MINI_SIZE); FRAGMENT_COUNT];
    for block in mixed.chunks_exact(MACRO_SIZE) {
        for (fragment, mini) in fragments.iter_mut().zip(block.chunks_exact(MINI_SIZE)) {
            fragment.extend_from_slice(mini);
        }
    }
    fragments
}

fn unslice(fragments: &[Vec<u8>]) -> Vec<u8> {
    let macros = fragments.first().map_or(0, |f| f.len() / MINI_SIZE);
    let mut out = vec![0u8; macros * MACRO_SIZE];
    for (j, fragment) in fragments.iter().enumerate() {
        for (i, mini) in fragment.chunks_exact(MINI_SIZE).enumerate() {
            let start = i * MACRO_SIZE + j * MINI_SIZE;
            out[start..start + MINI_SIZE].copy_from_slice(mini);
        }
    }
    out
}

fn write_fragment(dir: &Path, index: usize, data: &[u8]) -> Result<(), CodecError> {
    let dest = dir.join(fragment_name(index));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CodecError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| CodecError::io(&dest, e))?;
    tmp.persist(&dest)
        .map_err(|e| CodecError::io(&dest, e.error))?;
    Ok(())
}

impl Codec for MixSliceCodec {
    fn encrypt(
        &self,
        plaintext: &[u8],
        path: &Path,
        key: &FileKey,
        iv: &FileIv,
    ) -> Result<(), CodecError> {
        let mut data = pad(plaintext);
        mix(&mut data, key, iv);
        let fragments = slice(&data);

        fs::create_dir_all(path).map_err(|e| CodecError::io(path, e))?;
        for (index, fragment) in fragments.iter().enumerate() {
            write_fragment(path, index, fragment)?;
        }

        debug!(
            path = %path.display(),
            plaintext_len = plaintext.len(),
            fragment_len = fragments.first().map_or(0, Vec::len),
            "Encoded fragment set"
        );
        Ok(())
    }

    fn decrypt(&self, path: &Path, key: &FileKey, iv: &FileIv) -> Result<Vec<u8>, CodecError> {
        let mut names = Vec::with_capacity(FRAGMENT_COUNT);
        for entry in fs::read_dir(path).map_err(|e| CodecError::io(path, e))? {
            let entry = entry.map_err(|e| CodecError::io(path, e))?;
            if let Some(name) = entry.file_name().to_str()
                && is_fragment_name(name)
            {
                names.push(name.to_string());
            }
        }

        if names.len() != FRAGMENT_COUNT {
            return Err(CodecError::FragmentCount {
                path: path.to_path_buf(),
                expected: FRAGMENT_COUNT,
                actual: names.len(),
            });
        }
        names.sort_unstable();

        let mut fragments = Vec::with_capacity(FRAGMENT_COUNT);
        for name in &names {
            let fragment_path = path.join(name);
            let data = fs::read(&fragment_path).map_err(|e| CodecError::io(&fragment_path, e))?;
            fragments.push(data);
        }

        let fragment_len = fragments[0].len();
        if fragment_len == 0 || fragment_len % MINI_SIZE != 0 {
            return Err(CodecError::MalformedFragment {
                path: path.to_path_buf(),
                reason: format!("fragment length {fragment_len} is not a positive multiple of {MINI_SIZE}"),
            });
        }
        if let Some(bad) = fragments.iter().position(|f| f.len() != fragment_len) {
            return Err(CodecError::MalformedFragment {
                path: path.to_path_buf(),
                reason: format!(
                    "fragment {} has length {}, expected {fragment_len}",
                    names[bad],
                    fragments[bad].len()
                ),
            });
        }

        let mut data = unslice(&fragments);
        mix(&mut data, key, iv);
        let plaintext = unpad(data).ok_or_else(|| CodecError::Padding {
            path: path.to_path_buf(),
        })?;

        trace!(path = %path.display(), plaintext_len = plaintext.len(), "Decoded fragment set");
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key_iv() -> (FileKey, FileIv) {
        (FileKey::from_bytes([1; 16]), FileIv::from_bytes([2; 16]))
    }

    #[test]
    fn test_fragment_names_are_zero_padded() {
        assert_eq!(fragment_name(0), "frag_0000.dat");
        assert_eq!(fragment_name(1023), "frag_1023.dat");
        assert!(is_fragment_name("frag_0042.dat"));
        assert!(!is_fragment_name(".tmpAbCdEf"));
    }

    #[test]
    fn test_pad_always_adds_a_block_boundary() {
        assert_eq!(pad(b"").len(), MACRO_SIZE);
        assert_eq!(pad(&[1; MACRO_SIZE - 1]).len(), MACRO_SIZE);
        assert_eq!(pad(&[1; MACRO_SIZE]).len(), 2 * MACRO_SIZE);
    }

    #[test]
    fn test_unpad_reverses_pad() {
        for len in [0usize, 1, 5, MACRO_SIZE - 1, MACRO_SIZE, MACRO_SIZE + 3] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(unpad(pad(&data)).as_deref(), Some(data.as_slice()));
        }
    }

    #[test]
    fn test_unpad_keeps_trailing_zero_bytes_of_plaintext() {
        let data = vec![9, 0, 0, 0];
        assert_eq!(unpad(pad(&data)), Some(data));
    }

    #[test]
    fn test_unpad_rejects_garbage() {
        assert_eq!(unpad(vec![0; MACRO_SIZE]), None);
        assert_eq!(unpad(vec![0x41; MACRO_SIZE]), None);
    }

    #[test]
    fn test_slice_unslice_inverse() {
        let data: Vec<u8> = (0..2 * MACRO_SIZE).map(|i| (i % 256) as u8).collect();
        let fragments = slice(&data);
        assert_eq!(fragments.len(), FRAGMENT_COUNT);
        assert!(fragments.iter().all(|f| f.len() == 2 * MINI_SIZE));
        // fragment 1 starts with mini block 1 of the first macro block
        assert_eq!(&fragments[1][..MINI_SIZE], &data[MINI_SIZE..2 * MINI_SIZE]);
        assert_eq!(unslice(&fragments), data);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file.txt");
        let (key, iv) = key_iv();
        let codec = MixSliceCodec::new();

        let plaintext = b"The quick brown fox jumps over the lazy dog".repeat(200);
        codec.encrypt(&plaintext, &target, &key, &iv).unwrap();

        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).unwrap().count(), FRAGMENT_COUNT);
        assert_eq!(codec.decrypt(&target, &key, &iv).unwrap(), plaintext);
    }

    #[test]
    fn test_encrypt_empty_plaintext() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("empty");
        let (key, iv) = key_iv();
        let codec = MixSliceCodec::new();

        codec.encrypt(b"", &target, &key, &iv).unwrap();
        assert_eq!(codec.decrypt(&target, &key, &iv).unwrap(), b"");
    }

    #[test]
    fn test_fragments_do_not_contain_plaintext() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("secret");
        let (key, iv) = key_iv();
        MixSliceCodec
            .encrypt(&[b'A'; MACRO_SIZE], &target, &key, &iv)
            .unwrap();

        let fragment = fs::read(target.join(fragment_name(0))).unwrap();
        assert_ne!(&fragment[..MINI_SIZE], b"AAAA");
    }

    #[test]
    fn test_reencrypt_shrinks_fragments() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file");
        let (key, iv) = key_iv();
        let codec = MixSliceCodec::new();

        codec.encrypt(&vec![7; 3 * MACRO_SIZE], &target, &key, &iv).unwrap();
        codec.encrypt(b"short", &target, &key, &iv).unwrap();
        assert_eq!(codec.decrypt(&target, &key, &iv).unwrap(), b"short");
    }

    #[test]
    fn test_decrypt_wrong_fragment_count() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file");
        let (key, iv) = key_iv();
        MixSliceCodec.encrypt(b"data", &target, &key, &iv).unwrap();
        fs::remove_file(target.join(fragment_name(17))).unwrap();

        match MixSliceCodec.decrypt(&target, &key, &iv) {
            Err(CodecError::FragmentCount {
                expected, actual, ..
            }) => {
                assert_eq!(expected, FRAGMENT_COUNT);
                assert_eq!(actual, FRAGMENT_COUNT - 1);
            }
            other => panic!("expected FragmentCount, got {other:?}"),
        }
    }

    #[test]
    fn test_decrypt_ignores_stray_temp_files() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file");
        let (key, iv) = key_iv();
        MixSliceCodec.encrypt(b"data", &target, &key, &iv).unwrap();
        fs::write(target.join(".tmpLeftover"), b"junk").unwrap();

        assert_eq!(MixSliceCodec.decrypt(&target, &key, &iv).unwrap(), b"data");
    }

    #[test]
    fn test_decrypt_uneven_fragments() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file");
        let (key, iv) = key_iv();
        MixSliceCodec.encrypt(b"data", &target, &key, &iv).unwrap();
        fs::write(target.join(fragment_name(3)), [0u8; 8]).unwrap();

        assert!(matches!(
            MixSliceCodec.decrypt(&target, &key, &iv),
            Err(CodecError::MalformedFragment { .. })
        ));
    }

    #[test]
    fn test_decrypt_missing_directory() {
        let dir = TempDir::new().unwrap();
        let (key, iv) = key_iv();
        assert!(matches!(
            MixSliceCodec.decrypt(&dir.path().join("nope"), &key, &iv),
            Err(CodecError::Io { .. })
        ));
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails_or_differs() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("file");
        let (key, iv) = key_iv();
        MixSliceCodec.encrypt(b"attack at dawn", &target, &key, &iv).unwrap();

        let wrong = FileKey::from_bytes([9; 16]);
        match MixSliceCodec.decrypt(&target, &wrong, &iv) {
            Ok(plaintext) => assert_ne!(plaintext, b"attack at dawn"),
            Err(e) => assert!(matches!(e, CodecError::Padding { .. })),
        }
    }
}
