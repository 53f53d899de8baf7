//! A contiguous cached fragment of a remote file.

use bytes::Bytes;

use crate::error::FsResult;
use crate::io::ReadSeekCloser;

/// One buffered run of bytes at a known file offset.
#[derive(Debug, Default)]
pub struct FileFragment {
    offset: u64,
    data: Vec<u8>,
}

impl FileFragment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Satisfy a read from the buffered data if the requested offset falls
    /// inside this fragment. Returns the overlap, which may be shorter
    /// than `size`.
    #[must_use]
    pub fn read(&self, offset: u64, size: usize) -> Option<Bytes> {
        let start = offset.checked_sub(self.offset)?;
        let start = usize::try_from(start).ok()?;
        if start >= self.data.len() {
            return None;
        }
        let end = start.saturating_add(size).min(self.data.len());
        Some(Bytes::copy_from_slice(&self.data[start..end]))
    }

    /// Refill this fragment from `stream`, reading at least `min` bytes
    /// (unless the stream ends first) and at most `max`. `offset` is the
    /// stream's current position and is advanced past every byte consumed.
    ///
    /// Returns `true` when end-of-stream was reached before `min` bytes
    /// arrived. The buffer's capacity is reused across refills.
    pub fn fill_from(
        &mut self,
        stream: &mut dyn ReadSeekCloser,
        offset: &mut u64,
        min: usize,
        max: usize,
    ) -> FsResult<bool> {
        self.offset = *offset;
        self.data.resize(max, 0);

        let mut total = 0;
        let mut eof = false;
        while total < min {
            match stream.read(&mut self.data[total..max]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    *offset += n as u64;
                    total += n;
                }
                Err(e) => {
                    self.data.truncate(total);
                    return Err(e);
                }
            }
        }
        self.data.truncate(total);
        Ok(eof)
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
