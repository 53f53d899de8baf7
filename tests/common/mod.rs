//! Shared test doubles for the I/O suites.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hdfsfs::error::FsResult;
use hdfsfs::io::{ReadSeekCloser, ReadSeekCloserFactory};

/// Backend operation counters shared by every stream of one file.
#[derive(Debug, Default)]
pub struct ReaderStats {
    pub reads: AtomicU64,
    pub seeks: AtomicU64,
}

impl ReaderStats {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn seeks(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }
}

/// Deterministic pseudo-random content: every byte is a function of its
/// offset, so any read can be verified without storing the file.
pub fn content_byte(offset: u64) -> u8 {
    let o = offset as i64;
    ((o % 7 + o % 11 + o % 13 + o % 127 + o % 251 + o % 31337 + o % 1_299_709) % 256) as u8
}

/// A virtual file of `size` bytes of [`content_byte`] data.
pub struct PseudoRandomFile {
    pub size: u64,
    pub stats: Arc<ReaderStats>,
    /// Cap on bytes returned per backend read; `None` serves full
    /// requests.
    pub chunk_limit: Option<usize>,
    /// Per-read delay, to force thread interleaving in stress tests.
    pub read_delay: Duration,
}

impl PseudoRandomFile {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            stats: Arc::new(ReaderStats::default()),
            chunk_limit: None,
            read_delay: Duration::ZERO,
        }
    }
}

impl ReadSeekCloserFactory for PseudoRandomFile {
    fn open_read(&self) -> FsResult<Box<dyn ReadSeekCloser>> {
        Ok(Box::new(PseudoRandomStream {
            size: self.size,
            pos: 0,
            stats: Arc::clone(&self.stats),
            chunk_limit: self.chunk_limit,
            read_delay: self.read_delay,
        }))
    }
}

pub struct PseudoRandomStream {
    size: u64,
    pos: u64,
    stats: Arc<ReaderStats>,
    chunk_limit: Option<usize>,
    read_delay: Duration,
}

impl ReadSeekCloser for PseudoRandomStream {
    fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        if self.pos >= self.size {
            return Ok(0);
        }
        let mut n = buf.len();
        if let Some(limit) = self.chunk_limit {
            n = n.min(limit);
        }
        n = n.min((self.size - self.pos) as usize);
        for (i, slot) in buf[..n].iter_mut().enumerate() {
            *slot = content_byte(self.pos + i as u64);
        }
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> FsResult<()> {
        self.stats.seeks.fetch_add(1, Ordering::Relaxed);
        self.pos = pos;
        Ok(())
    }

    fn position(&mut self) -> FsResult<u64> {
        Ok(self.pos)
    }

    fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}
