//! Byte buffer, blocks, and the shortlex ordering
//!
//! The buffer is the one datum every other component manipulates: a bounded,
//! append-only sequence of bytes plus bookkeeping of the contiguous spans
//! ("blocks") that each primitive draw consumed. Two buffers that compare
//! byte-equal must, given the same predicate and generator, produce
//! byte-equal verdicts and byte-equal recorded structure.

#![forbid(unsafe_code)]

use std::cmp::Ordering;

use thiserror::Error;

/// Errors raised while assembling or indexing a [`Buffer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer_size must be positive (got {0})")]
    BadSize(usize),
    #[error("block [{start}, {end}) out of range (buffer has {len} bytes)")]
    BlockOutOfRange { start: usize, end: usize, len: usize },
}

/// A non-empty contiguous span `[start, end)` recorded by a single primitive
/// draw. Blocks are disjoint and stored in the order they were produced,
/// which is also position order (draws only ever consume forward).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    pub start: usize,
    pub end: usize,
}

impl Block {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A finite, bounded byte sequence and the sole source of non-determinism
/// for a single [`crate::testcase::TestCase`] run.
///
/// `Buffer` itself does not know about example regions (those are tracked by
/// `TestCase`, which owns the cursor); it only owns the bytes and the flat
/// list of blocks drawn from them, in draw order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Buffer {
    bytes: Vec<u8>,
    blocks: Vec<Block>,
}

impl Buffer {
    /// An empty buffer with no recorded blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes with no block structure. Used to replay a buffer
    /// fetched from the database, or a candidate produced by the shrinker,
    /// before it is run through a `TestCase` (which will populate `blocks`).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, blocks: Vec::new() }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Append `n` bytes (already known to exist, e.g. sliced off a source
    /// buffer by the caller) and record the block they occupy.
    ///
    /// Used only by buffer *construction* paths (fresh random synthesis,
    /// mutation). The draw-time recording used by `TestCase` goes through
    /// [`Buffer::record_block`] directly since those bytes already live in
    /// the buffer.
    pub fn push_block(&mut self, data: &[u8]) {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(data);
        let end = self.bytes.len();
        if end > start {
            self.blocks.push(Block { start, end });
        }
    }

    /// Record that the bytes already present at `[start, end)` constitute one
    /// block. `start`/`end` must describe a span already within the buffer.
    pub fn record_block(&mut self, start: usize, end: usize) -> Result<(), BufferError> {
        if end > self.bytes.len() || start > end {
            return Err(BufferError::BlockOutOfRange { start, end, len: self.bytes.len() });
        }
        if end > start {
            self.blocks.push(Block { start, end });
        }
        Ok(())
    }

    /// The byte slice underlying a given block.
    pub fn block_bytes(&self, block: Block) -> &[u8] {
        &self.bytes[block.start..block.end]
    }

    /// Return a copy of this buffer with the bytes at `[start, end)` removed
    /// and no block/example structure (the caller re-runs it through a fresh
    /// `TestCase` to rebuild structure against the new bytes).
    pub fn without_range(&self, start: usize, end: usize) -> Buffer {
        let mut out = Vec::with_capacity(self.bytes.len().saturating_sub(end - start));
        out.extend_from_slice(&self.bytes[..start]);
        out.extend_from_slice(&self.bytes[end..]);
        Buffer::from_bytes(out)
    }

    /// Return a copy with `[start, end)` replaced by `replacement`.
    pub fn with_range_replaced(&self, start: usize, end: usize, replacement: &[u8]) -> Buffer {
        let mut out = Vec::with_capacity(self.bytes.len() - (end - start) + replacement.len());
        out.extend_from_slice(&self.bytes[..start]);
        out.extend_from_slice(replacement);
        out.extend_from_slice(&self.bytes[end..]);
        Buffer::from_bytes(out)
    }
}

/// Total order on byte strings: shorter first, then lexicographic. This
/// is the shrinker's sole objective — every accepted shrink move must
/// strictly decrease rank under this order.
pub fn shortlex_cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[inline]
pub fn shortlex_lt(a: &[u8], b: &[u8]) -> bool {
    shortlex_cmp(a, b) == Ordering::Less
}
