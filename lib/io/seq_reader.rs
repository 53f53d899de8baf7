//! Two-buffer read cache over a sequential backend stream.
//!
//! The kernel issues read requests that are *mostly* sequential but may
//! arrive slightly reordered or with small gaps (read-ahead, page-cache
//! interaction). A hard seek on the backend costs a connection, so small
//! forward gaps are read through and discarded instead; only large or
//! backward jumps seek. Two fragments are kept so that a request falling
//! just behind the current position can still be served from cache.

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::io::{FileFragment, ReadSeekCloser};

/// Granularity of backend reads. Refills are rounded up to this size.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Cache effectiveness counters, logged when the reader closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadCounters {
    /// Small forward gaps read through and discarded.
    pub holes: u64,
    /// Requests served entirely from a cached fragment.
    pub cache_hits: u64,
    /// Hard seeks issued on the backend stream.
    pub seeks: u64,
}

/// Serves positional reads from a sequential stream via two cached
/// fragments (fragment one is always the most recently filled).
pub struct SequentialReader {
    stream: Box<dyn ReadSeekCloser>,
    /// The backend stream's current position.
    offset: u64,
    buf1: FileFragment,
    buf2: FileFragment,
    counters: ReadCounters,
}

impl SequentialReader {
    #[must_use]
    pub fn new(stream: Box<dyn ReadSeekCloser>) -> Self {
        Self {
            stream,
            offset: 0,
            buf1: FileFragment::new(),
            buf2: FileFragment::new(),
            counters: ReadCounters::default(),
        }
    }

    /// Serve a kernel read of `size` bytes at `offset`.
    ///
    /// Short refills are retried until the request is complete; end of
    /// stream returns whatever prefix was assembled, which may be empty.
    pub fn read(&mut self, offset: u64, size: usize) -> FsResult<Bytes> {
        let mut out = BytesMut::with_capacity(size.min(BLOCK_SIZE * 2));
        let mut pos = offset;
        while out.len() < size {
            let chunk = self.read_some(pos, size - out.len())?;
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// One iteration of the read loop: serve from cache or refill
    /// fragment one. An empty result means end of stream.
    fn read_some(&mut self, offset: u64, size: usize) -> FsResult<Bytes> {
        if let Some(data) = self.buf1.read(offset, size) {
            self.counters.cache_hits += 1;
            return Ok(data);
        }
        if let Some(data) = self.buf2.read(offset, size) {
            self.counters.cache_hits += 1;
            return Ok(data);
        }

        // Neither fragment covers the request: the old MRU becomes LRU and
        // fragment one is refilled from the backend.
        std::mem::swap(&mut self.buf1, &mut self.buf2);

        let mut max_bytes = size;
        let mut min_bytes = 1;
        if offset != self.offset {
            let small_hole = offset > self.offset
                && offset - self.offset <= (2 * BLOCK_SIZE) as u64;
            if small_hole {
                // Read through the gap; the skipped bytes land in the
                // fragment and may serve a latecomer request.
                let hole = (offset - self.offset) as usize;
                self.counters.holes += 1;
                max_bytes += hole;
                min_bytes = hole + 1;
            } else {
                self.counters.seeks += 1;
                self.stream.seek(offset)?;
                self.offset = offset;
            }
        }

        let max_bytes = max_bytes.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let hit_eof =
            self.buf1
                .fill_from(&mut *self.stream, &mut self.offset, min_bytes, max_bytes)?;

        match self.buf1.read(offset, size) {
            Some(data) => Ok(data),
            None if hit_eof => Ok(Bytes::new()),
            None => Err(FsError::Internal(
                "refilled fragment does not cover the requested offset".into(),
            )),
        }
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn counters(&self) -> ReadCounters {
        self.counters
    }

    /// Close the backend stream, logging cache effectiveness.
    pub fn close(&mut self) -> FsResult<()> {
        debug!(
            holes = self.counters.holes,
            cache_hits = self.counters.cache_hits,
            seeks = self.counters.seeks,
            "sequential reader closed"
        );
        self.stream.close()
    }
}
