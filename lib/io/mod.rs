//! Positional-stream abstractions.
//!
//! The remote store hands out sequential-only streams: reading is cheap,
//! seeking costs a new backend connection. Everything in this module is
//! built around that asymmetry.

/// Buffered sequential fragments of a file.
pub mod fragment;
/// Pooled positional readers for concurrent random access.
pub mod random_access;
/// Two-buffer read cache that tolerates slightly reordered requests.
pub mod seq_reader;

pub use fragment::FileFragment;
pub use random_access::{DEFAULT_MAX_READERS, RandomAccessReader};
pub use seq_reader::{BLOCK_SIZE, SequentialReader};

use crate::error::FsResult;

/// A read-only stream over a remote file with explicit positioning.
///
/// Not thread safe; callers serialize access. `read` returning `Ok(0)`
/// signals end of stream.
pub trait ReadSeekCloser: Send {
    /// Read up to `buf.len()` bytes at the current position.
    fn read(&mut self, buf: &mut [u8]) -> FsResult<usize>;

    /// Reposition the stream to the absolute offset `pos`.
    fn seek(&mut self, pos: u64) -> FsResult<()>;

    /// The current absolute read position.
    fn position(&mut self) -> FsResult<u64>;

    /// Release the stream and any backend resources it holds.
    fn close(&mut self) -> FsResult<()>;
}

/// Opens fresh [`ReadSeekCloser`] streams over one file.
pub trait ReadSeekCloserFactory: Send + Sync {
    /// Open a new independent stream positioned at offset zero.
    fn open_read(&self) -> FsResult<Box<dyn ReadSeekCloser>>;
}

/// Close a stream off the caller's critical path.
///
/// Closing a backend stream may block on connection teardown; pool
/// housekeeping (displaced readers, overflow, error cleanup) must not wait
/// for it.
pub fn close_async(mut stream: Box<dyn ReadSeekCloser>) {
    std::thread::Builder::new()
        .name("stream-close".into())
        .spawn(move || {
            if let Err(e) = stream.close() {
                tracing::debug!(error = %e, "background stream close failed");
            }
        })
        .map(|_| ())
        .unwrap_or_else(|e| tracing::warn!(error = %e, "could not spawn close thread"));
}
