//! Bounded output buffers for child process capture.
//!
//! - [`TailBuffer`] keeps only the most recent `max_bytes` of a stream and
//!   flags truncation as soon as any byte is dropped. Used where only the end
//!   of the output matters.
//! - [`CappedBuffer`] keeps the whole stream but refuses to grow past a hard
//!   cap. Used where the caller needs the complete payload, so overflowing is
//!   a failure rather than a truncation.

use std::collections::VecDeque;

/// Ring buffer retaining the last `max_bytes` bytes pushed into it.
///
/// For any sequence of pushes, [`to_vec`](Self::to_vec) equals the suffix of
/// length `min(max_bytes, total_bytes)` of the concatenated input, regardless
/// of how the input was chunked.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    buf: VecDeque<u8>,
    max_bytes: usize,
    total_bytes: u64,
}

impl TailBuffer {
    /// Create an empty tail buffer with the given byte budget.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(max_bytes.min(64 * 1024)),
            max_bytes,
            total_bytes: 0,
        }
    }

    /// Append a chunk, dropping the oldest bytes beyond the budget.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total_bytes = self.total_bytes.saturating_add(chunk.len() as u64);

        if chunk.len() >= self.max_bytes {
            // The chunk alone fills the budget; keep only its tail.
            self.buf.clear();
            let start = chunk.len().saturating_sub(self.max_bytes);
            self.buf.extend(&chunk[start..]);
            return;
        }

        let overflow = self
            .buf
            .len()
            .saturating_add(chunk.len())
            .saturating_sub(self.max_bytes);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(chunk);
    }

    /// Whether any byte has been dropped.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.total_bytes > self.max_bytes as u64
    }

    /// Total bytes pushed, including dropped ones.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of bytes currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Copy out the retained bytes, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    /// Retained bytes as (lossy) UTF-8 text.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }
}

/// Signals that a [`CappedBuffer`] would have exceeded its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapExceeded;

/// Buffer that holds a complete stream up to a hard cap.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    buf: Vec<u8>,
    max_bytes: usize,
    overflowed: bool,
}

impl CappedBuffer {
    /// Create an empty buffer with the given hard cap.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes,
            overflowed: false,
        }
    }

    /// Append a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`CapExceeded`] if the chunk would push the buffer past its
    /// cap. The chunk is discarded and the buffer stays overflowed; later
    /// pushes also fail.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), CapExceeded> {
        if self.overflowed || self.buf.len().saturating_add(chunk.len()) > self.max_bytes {
            self.overflowed = true;
            return Err(CapExceeded);
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Whether the cap has been exceeded.
    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// Consume the buffer, returning the captured bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
