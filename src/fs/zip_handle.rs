//! Read handles for archive entries.
//!
//! Archive content comes off a decompressor, which only moves forward,
//! so these handles are opened non-seekable. The kernel then promises
//! sequential reads but still dispatches read-ahead in parallel, and
//! those requests can reach us out of order; a reader whose offset is
//! not next in line parks on a condvar until its turn, with a bounded
//! wait so a genuinely out-of-line request fails instead of hanging.

use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use hdfsfs::error::{FsError, FsResult};

use crate::fs::zip::ZipStreamAdapter;

/// Chunks in flight between the decompressor thread and the handle.
const CHANNEL_DEPTH: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

/// How long one read waits for earlier reads to catch up.
const OUT_OF_ORDER_SLICE: Duration = Duration::from_millis(10);
const OUT_OF_ORDER_BUDGET: Duration = Duration::from_secs(2);

pub struct ZipFileHandle {
    state: Mutex<HandleState>,
    turn: Condvar,
}

struct HandleState {
    /// The next offset a read must start at.
    offset: u64,
    stream: Option<ChunkStream>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ZipFileHandle {
    /// Start a decompression stream for entry `index` of `archive`.
    pub(crate) fn spawn(
        archive: zip::ZipArchive<ZipStreamAdapter>,
        index: usize,
    ) -> FsResult<Arc<Self>> {
        let (tx, rx) = sync_channel(CHANNEL_DEPTH);
        let thread = std::thread::Builder::new()
            .name("zip-decompress".into())
            .spawn(move || decompress(archive, index, &tx))?;
        Ok(Arc::new(Self {
            state: Mutex::new(HandleState {
                offset: 0,
                stream: Some(ChunkStream::new(rx)),
                thread: Some(thread),
            }),
            turn: Condvar::new(),
        }))
    }

    /// Serve a kernel read. Must be at the stream's current offset;
    /// early read-ahead waits briefly for its turn.
    pub fn read(&self, offset: u64, size: usize) -> FsResult<Bytes> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut waited = Duration::ZERO;
        while state.offset != offset {
            if offset < state.offset {
                return Err(FsError::Internal(format!(
                    "backward read at {offset} on a forward-only archive stream at {}",
                    state.offset
                )));
            }
            if waited >= OUT_OF_ORDER_BUDGET {
                return Err(FsError::Internal(format!(
                    "read at {offset} never became current (stream at {})",
                    state.offset
                )));
            }
            let (guard, _timeout) = self
                .turn
                .wait_timeout(state, OUT_OF_ORDER_SLICE)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
            waited += OUT_OF_ORDER_SLICE;
        }

        let stream = state
            .stream
            .as_mut()
            .ok_or(FsError::ReaderClosed)?;
        let data = stream.take(size)?;
        state.offset += data.len() as u64;
        drop(state);
        self.turn.notify_all();
        Ok(data)
    }

    /// Tear the stream down; the decompressor thread exits on its next
    /// send.
    pub fn release(&self) -> FsResult<()> {
        let thread = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.stream = None;
            state.thread.take()
        };
        self.turn.notify_all();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                debug!("decompressor thread panicked");
            }
        }
        Ok(())
    }
}

/// Pull-side of the decompression channel with chunk reassembly.
struct ChunkStream {
    rx: Receiver<Result<Vec<u8>, String>>,
    chunk: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl ChunkStream {
    fn new(rx: Receiver<Result<Vec<u8>, String>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    /// Up to `size` bytes; fewer only at end of entry.
    fn take(&mut self, size: usize) -> FsResult<Bytes> {
        let mut out = Vec::with_capacity(size.min(CHUNK_SIZE * 2));
        while out.len() < size {
            if self.pos >= self.chunk.len() {
                if self.finished {
                    break;
                }
                match self.rx.recv() {
                    Ok(Ok(chunk)) => {
                        self.chunk = chunk;
                        self.pos = 0;
                    }
                    Ok(Err(msg)) => {
                        self.finished = true;
                        return Err(FsError::Transport(format!("decompression: {msg}")));
                    }
                    Err(_) => {
                        self.finished = true;
                        break;
                    }
                }
            }
            let want = size - out.len();
            let available = self.chunk.len() - self.pos;
            let n = want.min(available);
            out.extend_from_slice(&self.chunk[self.pos..self.pos + n]);
            self.pos += n;
        }
        Ok(Bytes::from(out))
    }
}

fn decompress(
    mut archive: zip::ZipArchive<ZipStreamAdapter>,
    index: usize,
    tx: &SyncSender<Result<Vec<u8>, String>>,
) {
    let mut entry = match archive.by_index(index) {
        Ok(entry) => entry,
        Err(e) => {
            let _ = tx.send(Err(e.to_string()));
            return;
        }
    };
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match std::io::Read::read(&mut entry, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // A send error means the handle was released.
                if tx.send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e.to_string()));
                break;
            }
        }
    }
}
