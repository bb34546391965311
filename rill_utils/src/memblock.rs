//! Reference counted audio blocks.
//!
//! Audio travels in [`MemChunk`]s: a window onto an immutable, shared block.
//! Cloning a chunk never copies audio.

use core::{fmt, num};
use std::rc::Rc;

/// A window of `length` bytes starting at `index` into a shared block.
#[derive(Clone)]
pub struct MemChunk {
    block: Rc<[u8]>,
    index: usize,
    length: usize,
}

impl fmt::Debug for MemChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemChunk")
            .field("block_len", &self.block.len())
            .field("index", &self.index)
            .field("length", &self.length)
            .finish()
    }
}

impl MemChunk {
    /// Wraps a whole buffer, taking ownership of it.
    #[inline]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        Self {
            block: bytes.into(),
            index: 0,
            length,
        }
    }

    /// A chunk of `length` zero bytes.
    #[inline]
    pub fn silence(length: usize) -> Self {
        Self::from_vec(vec![0; length])
    }

    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.length
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.block[self.index..self.index + self.length]
    }

    /// Sub-window of this chunk, sharing the same block.
    ///
    /// # Panics
    ///
    /// If `start + len` exceeds this chunk's length.
    #[inline]
    pub fn slice(&self, start: usize, len: usize) -> Self {
        assert!(start.strict_add(len) <= self.length);
        Self {
            block: Rc::clone(&self.block),
            index: self.index + start,
            length: len,
        }
    }

    /// Removes the first `n` bytes from this window.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.length);
        self.index += n;
        self.length -= n;
    }

    /// Shortens this window to `len` bytes.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.length = self.length.min(len);
    }
}

/// Source of audio blocks.
pub trait MemPool {
    /// Largest block this pool hands out.
    fn block_size_max(&self) -> num::NonZeroUsize;

    /// Copies `data` into a fresh block.
    ///
    /// Callers split their data so that `data.len() <= self.block_size_max()`.
    fn copy_from(&self, data: &[u8]) -> MemChunk;
}

/// A pool allocating every block on the heap.
#[derive(Debug, Clone, Copy)]
pub struct HeapPool {
    block_size_max: num::NonZeroUsize,
}

impl HeapPool {
    pub const DEFAULT_BLOCK_SIZE_MAX: num::NonZeroUsize = num::NonZeroUsize::new(64 * 1024).unwrap();

    #[inline(always)]
    pub const fn new(block_size_max: num::NonZeroUsize) -> Self {
        Self { block_size_max }
    }
}

impl Default for HeapPool {
    #[inline(always)]
    fn default() -> Self {
        Self::new(Self::DEFAULT_BLOCK_SIZE_MAX)
    }
}

impl MemPool for HeapPool {
    #[inline(always)]
    fn block_size_max(&self) -> num::NonZeroUsize {
        self.block_size_max
    }

    #[inline]
    fn copy_from(&self, data: &[u8]) -> MemChunk {
        MemChunk::from_vec(data.to_vec())
    }
}
