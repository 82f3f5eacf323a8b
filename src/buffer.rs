//! Growable byte buffer with page-granular capacity.
//!
//! A [`Buffer`]'s capacity is always a multiple of [`PAGE_SIZE`]; asking for
//! more room rounds up to the next page boundary, and dropping back to
//! empty releases the underlying allocation rather than holding it idle.

use crate::error::{Error, Result};

/// Page size used for capacity rounding. Comfortably above the historical
/// "at least 512 bytes" floor and matching common POSIX page sizes.
pub const PAGE_SIZE: usize = 4096;

fn round_up_to_page(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    ((n + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE
}

/// A growable byte buffer, sized in page multiples.
#[derive(Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capacity, always a multiple of [`PAGE_SIZE`] (or 0).
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// View of the buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Ensure at least `grow_by` additional bytes are addressable beyond
    /// the current length. `grow_by == 0` with an empty buffer releases
    /// the region entirely.
    pub fn resize(&mut self, grow_by: usize) -> Result<()> {
        if grow_by == 0 {
            if self.data.is_empty() && self.data.capacity() > 0 {
                self.data = Vec::new();
            }
            return Ok(());
        }
        let needed = round_up_to_page(self.data.len() + grow_by);
        if needed <= self.data.capacity() {
            return Ok(());
        }
        self.data
            .try_reserve_exact(needed - self.data.len())
            .map_err(|_| Error::OutOfMemory)?;
        Ok(())
    }

    /// Append `src`, growing as needed.
    pub fn push(&mut self, src: &[u8]) -> Result<()> {
        if self.data.len() + src.len() > self.data.capacity() {
            self.resize(src.len())?;
        }
        self.data.extend_from_slice(src);
        Ok(())
    }

    /// Discard up to `n` bytes from the front. Releases the underlying
    /// allocation if the buffer becomes empty.
    pub fn shrink(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
        if self.data.is_empty() && self.data.capacity() > 0 {
            self.data = Vec::new();
        }
    }

    /// Copy up to `n` front bytes into a new NUL-terminated vector (length
    /// `actual + 1`), then shrink the buffer by `actual`.
    pub fn pop(&mut self, n: usize) -> Vec<u8> {
        let actual = n.min(self.data.len());
        let mut out = Vec::with_capacity(actual + 1);
        out.extend_from_slice(&self.data[..actual]);
        out.push(0);
        self.shrink(actual);
        out
    }

    /// Find the first occurrence of any byte in `delims`, or of a NUL
    /// byte, and return its index. Used by line-oriented reads.
    pub(crate) fn find_terminator(&self, delims: &[u8]) -> Option<usize> {
        self.data
            .iter()
            .position(|b| *b == 0 || delims.contains(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn capacity_rounds_up_to_page_multiple() {
        let mut buf = Buffer::new();
        buf.push(&[0u8; 10]).unwrap();
        assert_eq!(buf.capacity(), PAGE_SIZE);
        buf.push(&vec![0u8; PAGE_SIZE]).unwrap();
        assert_eq!(buf.capacity(), 2 * PAGE_SIZE);
    }

    #[test]
    fn shrink_to_empty_releases_capacity() {
        let mut buf = Buffer::new();
        buf.push(b"hello").unwrap();
        buf.shrink(5);
        assert_eq!(buf.capacity(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn unrelated_buffer_does_not_inherit_a_freed_buffers_capacity() {
        let mut big = Buffer::new();
        big.push(&vec![0u8; 20 * PAGE_SIZE]).unwrap();
        big.shrink(20 * PAGE_SIZE);
        assert_eq!(big.capacity(), 0);

        let mut small = Buffer::new();
        small.push(b"one page please").unwrap();
        assert_eq!(small.capacity(), PAGE_SIZE);
    }

    #[test]
    fn pop_null_terminates_and_shrinks() {
        let mut buf = Buffer::new();
        buf.push(b"abcdef").unwrap();
        let out = buf.pop(3);
        assert_eq!(out, b"abc\0");
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.as_slice(), b"def");
    }

    #[test]
    fn pop_on_empty_buffer_yields_single_nul() {
        let mut buf = Buffer::new();
        assert_eq!(buf.pop(10), vec![0]);
    }

    #[test]
    fn find_terminator_locates_delim_or_nul() {
        let mut buf = Buffer::new();
        buf.push(b"line one\nline two").unwrap();
        assert_eq!(buf.find_terminator(b"\n"), Some(8));
    }
}
