//! Concurrent random access over sequential-only streams.
//!
//! A [`RandomAccessReader`] keeps a pool of idle positional streams keyed
//! by their current offset. A read at offset `o` preferentially takes the
//! stream already positioned at `o`, so N interleaved sequential scans of
//! distinct regions each keep riding their own stream and almost never
//! force a backend seek.

use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::error::{FsError, FsResult};
use crate::io::{ReadSeekCloser, ReadSeekCloserFactory, close_async};

/// Default cap on pooled idle streams.
pub const DEFAULT_MAX_READERS: usize = 256;

type Pool = FxHashMap<u64, Box<dyn ReadSeekCloser>>;

/// Pooled positional reader. Cheap to share; all methods take `&self`.
pub struct RandomAccessReader {
    factory: Arc<dyn ReadSeekCloserFactory>,
    /// Idle streams keyed by their next read offset. `None` once closed.
    pool: Mutex<Option<Pool>>,
    max_readers: usize,
}

impl RandomAccessReader {
    #[must_use]
    pub fn new(factory: Arc<dyn ReadSeekCloserFactory>) -> Self {
        Self::with_max_readers(factory, DEFAULT_MAX_READERS)
    }

    #[must_use]
    pub fn with_max_readers(factory: Arc<dyn ReadSeekCloserFactory>, max_readers: usize) -> Self {
        Self {
            factory,
            pool: Mutex::new(Some(Pool::default())),
            max_readers,
        }
    }

    /// Read up to `buf.len()` bytes at `offset`, looping until the buffer
    /// is full or the stream ends. Returns the number of bytes read.
    ///
    /// Concurrent calls proceed in parallel, each on its own stream; the
    /// pool lock is held only while taking and returning streams.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut stream = self.take(offset)?;
        match Self::read_fully(stream.as_mut(), buf, offset) {
            Ok(n) => {
                self.give_back(stream);
                Ok(n)
            }
            Err(e) => {
                close_async(stream);
                Err(e)
            }
        }
    }

    fn read_fully(
        stream: &mut dyn ReadSeekCloser,
        buf: &mut [u8],
        offset: u64,
    ) -> FsResult<usize> {
        if stream.position()? != offset {
            stream.seek(offset)?;
        }
        let mut total = 0;
        while total < buf.len() {
            let n = stream.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Take the stream positioned at `offset` if one is pooled, otherwise
    /// any idle stream, otherwise open a fresh one.
    fn take(&self, offset: u64) -> FsResult<Box<dyn ReadSeekCloser>> {
        {
            let mut guard = self.lock_pool();
            let pool = guard.as_mut().ok_or(FsError::ReaderClosed)?;
            if let Some(stream) = pool.remove(&offset) {
                return Ok(stream);
            }
            if let Some(&key) = pool.keys().next() {
                return Ok(pool.remove(&key).expect("key just observed"));
            }
        }
        // Pool is empty; open outside the lock.
        self.factory.open_read()
    }

    /// Return an idle stream to the pool, keyed by its new position.
    fn give_back(&self, mut stream: Box<dyn ReadSeekCloser>) {
        let Ok(key) = stream.position() else {
            close_async(stream);
            return;
        };

        let displaced = {
            let mut guard = self.lock_pool();
            match guard.as_mut() {
                Some(pool) if pool.len() < self.max_readers => pool.insert(key, stream),
                // Closed, or at capacity: drop this stream instead.
                _ => Some(stream),
            }
        };
        if let Some(stream) = displaced {
            close_async(stream);
        }
    }

    /// Close every pooled stream. Subsequent reads fail with
    /// [`FsError::ReaderClosed`].
    pub fn close(&self) -> FsResult<()> {
        let drained = self.lock_pool().take();
        if let Some(pool) = drained {
            for (_, mut stream) in pool {
                if let Err(e) = stream.close() {
                    tracing::debug!(error = %e, "pooled stream close failed");
                }
            }
        }
        Ok(())
    }

    fn lock_pool(&self) -> MutexGuard<'_, Option<Pool>> {
        self.pool.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for RandomAccessReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
