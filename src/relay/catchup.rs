//! Catchup buffer for late joiners
//!
//! Holds the most recent broadcast chunks, bounded by bytes. The broadcaster
//! appends under the stream lock and a joining client is primed from the
//! buffer under the same lock, so the primed bytes and the first live chunk
//! line up exactly.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Bounded ring of recent chunks
#[derive(Debug)]
pub struct CatchupBuffer {
    max_size: usize,
    current_size: usize,
    chunks: VecDeque<Bytes>,
}

impl CatchupBuffer {
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            chunks: VecDeque::new(),
        }
    }

    /// Append a chunk, dropping the oldest ones to make room
    ///
    /// Returns false if the chunk alone exceeds the buffer size; the buffer is
    /// emptied in that case so it never holds a gap.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        let size = chunk.len();
        if size > self.max_size {
            self.clear();
            return false;
        }

        while self.current_size + size > self.max_size {
            match self.chunks.pop_front() {
                Some(old) => self.current_size -= old.len(),
                None => break,
            }
        }

        self.current_size += size;
        self.chunks.push_back(chunk);
        true
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.current_size = 0;
    }

    /// Buffered bytes in broadcast order
    pub fn snapshot(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.current_size);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    pub fn size(&self) -> usize {
        self.current_size
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for CatchupBuffer {
    fn default() -> Self {
        Self::with_max_size(0)
    }
}
