//! Fault-tolerant positional stream.
//!
//! Wraps a backend read stream with a virtual offset. Seeks never touch
//! the backend; reads lazily reopen the file at the virtual offset after
//! a failure, so a dropped data-node connection costs one reopen rather
//! than an error surfaced to the kernel.

use std::sync::Arc;

use hdfsfs::error::FsResult;
use hdfsfs::io::{ReadSeekCloser, close_async};
use hdfsfs::retry::RetryPolicy;

use crate::hdfs::HdfsAccessor;

pub struct FaultTolerantReader {
    path: String,
    /// The *base* accessor: reopening through the fault-tolerant wrapper
    /// would nest retry loops.
    accessor: Arc<dyn HdfsAccessor>,
    policy: Arc<RetryPolicy>,
    stream: Option<Box<dyn ReadSeekCloser>>,
    /// Virtual read offset, maintained across reopens.
    pos: u64,
}

impl FaultTolerantReader {
    #[must_use]
    pub fn new(
        path: String,
        accessor: Arc<dyn HdfsAccessor>,
        policy: Arc<RetryPolicy>,
        stream: Box<dyn ReadSeekCloser>,
    ) -> Self {
        Self {
            path,
            accessor,
            policy,
            stream: Some(stream),
            pos: 0,
        }
    }
}

impl ReadSeekCloser for FaultTolerantReader {
    fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let mut op = self.policy.start_operation();
        loop {
            // (Re)establish a stream at the virtual offset. Failures here
            // are non-recoverable and propagate directly.
            if self.stream.is_none() {
                let mut stream = self.accessor.open_read(&self.path)?;
                stream.seek(self.pos)?;
                self.stream = Some(stream);
            }
            let stream = self.stream.as_mut().expect("stream present");
            if stream.position()? != self.pos {
                stream.seek(self.pos)?;
            }

            match stream.read(buf) {
                Ok(n) => {
                    self.pos += n as u64;
                    return Ok(n);
                }
                Err(e)
                    if e.is_benign()
                        || !op.should_retry(&format!("[{}] read: {e}", self.path)) =>
                {
                    return Err(e);
                }
                Err(_) => {
                    if let Some(stream) = self.stream.take() {
                        close_async(stream);
                    }
                }
            }
        }
    }

    fn seek(&mut self, pos: u64) -> FsResult<()> {
        // Virtual: errors, if any, surface on the next read.
        self.pos = pos;
        Ok(())
    }

    fn position(&mut self) -> FsResult<u64> {
        Ok(self.pos)
    }

    fn close(&mut self) -> FsResult<()> {
        match self.stream.take() {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use hdfsfs::clock::MockClock;

    use super::*;
    use crate::hdfs::mock::{MockFailure, MockHdfsAccessor};

    fn policy() -> Arc<RetryPolicy> {
        Arc::new(
            RetryPolicy::new(
                Arc::new(MockClock::new()),
                5,
                Duration::from_secs(300),
                Duration::from_secs(1),
                Duration::from_secs(60),
            )
            .with_randomize(false),
        )
    }

    #[test]
    fn survives_virtual_seek_and_reads_correct_bytes() {
        let mock = MockHdfsAccessor::new();
        mock.put_file("/f", (0..=255).collect());
        let inner: Arc<dyn HdfsAccessor> = mock.clone();
        let stream = inner.open_read("/f").unwrap();
        let mut reader = FaultTolerantReader::new("/f".into(), inner, policy(), stream);

        reader.seek(100).unwrap();
        assert_eq!(reader.position().unwrap(), 100);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [100, 101, 102, 103]);
        assert_eq!(reader.position().unwrap(), 104);
    }

    #[test]
    fn reopens_after_close_and_continues_at_offset() {
        let mock = MockHdfsAccessor::new();
        mock.put_file("/f", (0..=255).collect());
        let inner: Arc<dyn HdfsAccessor> = mock.clone();
        let stream = inner.open_read("/f").unwrap();
        let mut reader = FaultTolerantReader::new("/f".into(), inner, policy(), stream);

        let mut buf = [0u8; 8];
        reader.read(&mut buf).unwrap();
        // Drop the backing stream as a transport failure would.
        reader.stream = None;
        reader.read(&mut buf).unwrap();
        assert_eq!(buf, [8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(mock.open_read_count.load(Ordering::Relaxed), 2);
    }
}
