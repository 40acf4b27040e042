//! In-memory content buffer for entries that have no cache file open.
//!
//! An entry buffers bytes in memory while a download is streaming in, and for
//! writes that arrive before the content has been persisted. The buffer is
//! plain random-access storage; the entry tracks whether it is dirty, and
//! switches to the cache file before an extension would grow the buffer past
//! its memory limit.

/// Growable byte buffer with POSIX-style positional writes.
#[derive(Debug, Default)]
pub struct CacheBuffer {
    content: Vec<u8>,
}

#[allow(clippy::cast_possible_truncation)] // offsets are bounded by in-memory sizes
impl CacheBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            content: Vec::with_capacity(capacity),
        }
    }

    /// Writes `data` at `offset`.
    ///
    /// Bytes past the written range are kept. A gap between the current end
    /// and `offset` is zero-filled. Grows by at least 1.5x when extending so
    /// that sequential writes stay linear.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> usize {
        let offset = offset as usize;
        let end = offset + data.len();

        if end > self.content.len() {
            let new_capacity = std::cmp::max(end, (self.content.capacity() * 3) / 2);
            if new_capacity > self.content.capacity() {
                self.content.reserve(new_capacity - self.content.len());
            }
            self.content.resize(end, 0);
        }

        self.content[offset..end].copy_from_slice(data);
        data.len()
    }

    /// Appends downloaded bytes.
    pub fn append(&mut self, data: &[u8]) {
        self.content.extend_from_slice(data);
    }

    /// Reads up to `size` bytes at `offset`, clamped to the end of the buffer.
    pub fn read(&self, offset: u64, size: usize) -> &[u8] {
        let offset = offset as usize;
        if offset >= self.content.len() {
            return &[];
        }
        let end = offset.saturating_add(size).min(self.content.len());
        &self.content[offset..end]
    }

    /// Resizes to `size`, zero-extending if needed.
    ///
    /// Returns false (and does nothing) if the size is unchanged.
    pub fn truncate(&mut self, size: u64) -> bool {
        let size = size as usize;
        if size == self.content.len() {
            return false;
        }
        self.content.resize(size, 0);
        true
    }

    /// Drops all content.
    pub fn clear(&mut self) {
        self.content.clear();
    }

    /// Current length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    /// Returns true if nothing is buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// The buffered bytes.
    #[inline]
    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(bytes: &[u8]) -> CacheBuffer {
        let mut buf = CacheBuffer::new();
        buf.append(bytes);
        buf
    }

    #[test]
    fn test_write_at_start_keeps_tail() {
        let mut buf = filled(b"hello world");
        assert_eq!(buf.write(0, b"HELLO"), 5);
        assert_eq!(buf.content(), b"HELLO world");
    }

    #[test]
    fn test_write_extends_with_zero_gap() {
        let mut buf = filled(&[1, 2, 3]);
        buf.write(5, b"xyz");
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf.content()[..3], &[1, 2, 3]);
        assert_eq!(&buf.content()[3..5], &[0, 0]);
        assert_eq!(&buf.content()[5..], b"xyz");
    }

    #[test]
    fn test_write_over_partial_download() {
        // 3 bytes of a 10 byte file have arrived; a 5 byte write at 0 covers them.
        let mut buf = filled(b"abc");
        buf.write(0, b"12345");
        assert_eq!(buf.content(), b"12345");
    }

    #[test]
    fn test_read_clamped() {
        let buf = filled(b"hello world");
        assert_eq!(buf.read(0, 5), b"hello");
        assert_eq!(buf.read(6, 100), b"world");
        assert_eq!(buf.read(100, 10), b"");
        assert_eq!(buf.read(0, usize::MAX), b"hello world");
    }

    #[test]
    fn test_truncate() {
        let mut buf = filled(b"hello world");
        assert!(buf.truncate(5));
        assert_eq!(buf.content(), b"hello");

        assert!(buf.truncate(7));
        assert_eq!(buf.content(), b"hello\0\0");

        assert!(!buf.truncate(7));
    }

    #[test]
    fn test_truncate_empty_to_zero_is_noop() {
        let mut buf = CacheBuffer::with_capacity(16);
        assert!(!buf.truncate(0));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_large_gap() {
        let mut buf = CacheBuffer::new();
        buf.write(1000, b"end");
        assert_eq!(buf.len(), 1003);
        assert!(buf.content()[..1000].iter().all(|&b| b == 0));
        buf.clear();
        assert!(buf.is_empty());
    }
}
