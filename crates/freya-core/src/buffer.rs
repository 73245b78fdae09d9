//! In-memory plaintext of one open file.
//!
//! The Mix&Slice encoding spreads every macro block over all fragments, so a
//! single byte cannot be changed on disk without re-encoding the whole file.
//! [`ByteBuffer`] therefore holds the complete plaintext while a file is open:
//! 1. On open: the decrypted content is moved into the buffer
//! 2. On write/truncate: the buffer is modified in place
//! 3. On flush: the whole buffer is handed to the codec again
//!
//! The buffer itself tracks no dirty state; that belongs to the cache entry
//! that owns it.

use thiserror::Error;

/// Largest plaintext a buffer may hold.
///
/// The whole file lives in memory while open, so writes and truncates past
/// this size are refused instead of being left to the allocator.
pub const MAX_BUFFER_LEN: u64 = 1 << 36;

/// Errors from growing a [`ByteBuffer`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// The requested length is above [`MAX_BUFFER_LEN`].
    #[error("Requested length {requested} exceeds the {limit} byte limit")]
    TooLarge { requested: u64, limit: u64 },

    /// The allocator could not provide the memory.
    #[error("Out of memory growing buffer to {requested} bytes")]
    OutOfMemory { requested: u64 },
}

impl BufferError {
    fn too_large(requested: u64) -> Self {
        BufferError::TooLarge {
            requested,
            limit: MAX_BUFFER_LEN,
        }
    }
}

/// Growable, sparse-write-capable byte container.
///
/// # Example
///
/// ```
/// use freya_core::ByteBuffer;
///
/// let mut buf = ByteBuffer::empty();
/// buf.write(0, b"Hello, World!")?;
/// assert_eq!(buf.len(), 13);
/// assert_eq!(buf.read(0, 5), b"Hello");
///
/// // Writing past the end zero-fills the gap.
/// buf.write(20, b"!")?;
/// assert_eq!(buf.read(13, 7), &[0u8; 7]);
/// # Ok::<(), freya_core::buffer::BufferError>(())
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteBuffer {
    content: Vec<u8>,
}

impl ByteBuffer {
    /// Wrap existing plaintext (typically the output of a decrypt).
    pub fn new(content: Vec<u8>) -> Self {
        Self { content }
    }

    /// An empty buffer, used for freshly created files.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Convert a requested length to `usize`, refusing anything above
    /// [`MAX_BUFFER_LEN`].
    fn checked_len(len: u64) -> Result<usize, BufferError> {
        if len > MAX_BUFFER_LEN {
            return Err(BufferError::too_large(len));
        }
        usize::try_from(len).map_err(|_| BufferError::too_large(len))
    }

    /// Grow to `len` bytes with zeros. Growth is geometric (1.5x) when the
    /// allocator allows it, exact otherwise.
    fn grow_to(&mut self, len: usize) -> Result<(), BufferError> {
        let current = self.content.len();
        if len <= current {
            return Ok(());
        }
        let geometric = std::cmp::max(len, (self.content.capacity() * 3) / 2);
        if geometric > self.content.capacity()
            && self.content.try_reserve(geometric - current).is_err()
        {
            self.content
                .try_reserve_exact(len - current)
                .map_err(|_| BufferError::OutOfMemory {
                    requested: len as u64,
                })?;
        }
        self.content.resize(len, 0);
        Ok(())
    }

    /// Write `data` at `offset`.
    ///
    /// The buffer grows to `offset + data.len()` if needed and any gap between
    /// the old end and `offset` is filled with zeros.
    ///
    /// # Errors
    ///
    /// [`BufferError::TooLarge`] if the write would end past
    /// [`MAX_BUFFER_LEN`], [`BufferError::OutOfMemory`] if the memory cannot
    /// be allocated. The buffer is unchanged in both cases.
    ///
    /// # Returns
    ///
    /// The number of bytes written, which is always `data.len()`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, BufferError> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| BufferError::too_large(u64::MAX))?;
        let end = Self::checked_len(end)?;
        self.grow_to(end)?;

        let start = end - data.len();
        self.content[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    /// Read up to `size` bytes starting at `offset`.
    ///
    /// The result is clipped to the current length; an offset at or past the
    /// end yields an empty slice. Never fails.
    pub fn read(&self, offset: u64, size: usize) -> &[u8] {
        let Ok(offset) = usize::try_from(offset) else {
            return &[];
        };
        if offset >= self.content.len() {
            return &[];
        }
        let end = offset.saturating_add(size).min(self.content.len());
        &self.content[offset..end]
    }

    /// Set the length to `size`, zero-extending or discarding the tail.
    ///
    /// # Errors
    ///
    /// Same as [`ByteBuffer::write`] when growing.
    pub fn truncate(&mut self, size: u64) -> Result<(), BufferError> {
        let size = Self::checked_len(size)?;
        if size < self.content.len() {
            self.content.truncate(size);
        } else {
            self.grow_to(size)?;
        }
        Ok(())
    }

    /// Current length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// The full plaintext, for handing to the codec.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.content
    }

    /// Consume the buffer and return its content.
    pub fn into_inner(self) -> Vec<u8> {
        self.content
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(content: Vec<u8>) -> Self {
        Self::new(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_keeps_content() {
        let buf = ByteBuffer::new(vec![1, 2, 3]);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_empty() {
        let buf = ByteBuffer::empty();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.read(0, 10), b"");
    }

    #[test]
    fn test_write_then_read_back() {
        let mut buf = ByteBuffer::empty();
        assert_eq!(buf.write(0, b"hello").unwrap(), 5);
        assert_eq!(buf.read(0, 5), b"hello");
    }

    #[test]
    fn test_write_past_end_zero_fills_gap() {
        let mut buf = ByteBuffer::empty();
        buf.write(0, b"hello").unwrap();
        buf.write(10, b"X").unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.read(5, 6), &[0, 0, 0, 0, 0, b'X']);
    }

    #[test]
    fn test_write_in_middle_preserves_surrounding() {
        let mut buf = ByteBuffer::new(b"hello world".to_vec());
        buf.write(6, b"rust!").unwrap();
        assert_eq!(buf.as_slice(), b"hello rust!");
    }

    #[test]
    fn test_overlapping_writes() {
        let mut buf = ByteBuffer::new(vec![1, 2, 3, 4, 5]);
        buf.write(1, &[10, 11]).unwrap();
        buf.write(2, &[20]).unwrap();
        assert_eq!(buf.as_slice(), &[1, 10, 20, 4, 5]);
    }

    #[test]
    fn test_write_at_exact_end() {
        let mut buf = ByteBuffer::new(vec![1, 2, 3]);
        buf.write(3, &[4, 5]).unwrap();
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_zero_length_write_past_end_extends_to_offset() {
        let mut buf = ByteBuffer::new(vec![1, 2, 3]);
        assert_eq!(buf.write(10, &[]).unwrap(), 0);
        assert_eq!(buf.len(), 10);
        assert!(buf.as_slice()[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_clipped_to_length() {
        let buf = ByteBuffer::new(b"abcde".to_vec());
        assert_eq!(buf.read(4, 1), b"e");
        assert_eq!(buf.read(4, 10), b"e");
        assert_eq!(buf.read(5, 1), b"");
        assert_eq!(buf.read(100, 1), b"");
    }

    #[test]
    fn test_read_with_huge_size_does_not_overflow() {
        let buf = ByteBuffer::new(b"abc".to_vec());
        assert_eq!(buf.read(1, usize::MAX), b"bc");
    }

    #[test]
    fn test_truncate_shrinks() {
        let mut buf = ByteBuffer::new(b"hello world".to_vec());
        buf.truncate(5).unwrap();
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn test_truncate_grows_with_zeros() {
        let mut buf = ByteBuffer::empty();
        buf.truncate(100).unwrap();
        assert_eq!(buf.len(), 100);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_truncate_to_zero() {
        let mut buf = ByteBuffer::new(b"data".to_vec());
        buf.truncate(0).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_truncate_write_sequence() {
        let mut buf = ByteBuffer::empty();
        buf.write(0, b"hello").unwrap();
        buf.truncate(2).unwrap();
        buf.write(2, b"lp").unwrap();
        assert_eq!(buf.as_slice(), b"help");
        buf.truncate(10).unwrap();
        assert_eq!(&buf.as_slice()[..4], b"help");
        assert!(buf.as_slice()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sparse_write_past_limit_is_refused() {
        let mut buf = ByteBuffer::new(b"keep".to_vec());
        assert_eq!(
            buf.write(1 << 50, b"x"),
            Err(BufferError::TooLarge {
                requested: (1 << 50) + 1,
                limit: MAX_BUFFER_LEN,
            })
        );
        assert!(matches!(
            buf.write(u64::MAX, b"xy"),
            Err(BufferError::TooLarge { .. })
        ));
        assert_eq!(buf.as_slice(), b"keep");
    }

    #[test]
    fn test_truncate_past_limit_is_refused() {
        let mut buf = ByteBuffer::new(b"keep".to_vec());
        assert!(matches!(
            buf.truncate(1 << 40),
            Err(BufferError::TooLarge { .. })
        ));
        assert_eq!(buf.as_slice(), b"keep");
    }

    #[test]
    fn test_read_at_huge_offset_is_empty() {
        let buf = ByteBuffer::new(b"abc".to_vec());
        assert_eq!(buf.read(u64::MAX, 10), b"");
    }
}
