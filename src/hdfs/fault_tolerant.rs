//! Retry wrapper around an [`HdfsAccessor`].
//!
//! Benign errors pass straight through. Malignant errors reset the
//! underlying client (forcing a reconnect, possibly to the next name
//! node) and retry under the shared policy.

use std::sync::Arc;

use hdfsfs::error::FsResult;
use hdfsfs::io::ReadSeekCloser;
use hdfsfs::retry::RetryPolicy;

use crate::fs::attrs::{Attrs, FsInfo};
use crate::hdfs::reader::FaultTolerantReader;
use crate::hdfs::{HdfsAccessor, HdfsWriter};

pub struct FaultTolerantHdfsAccessor {
    inner: Arc<dyn HdfsAccessor>,
    policy: Arc<RetryPolicy>,
}

impl FaultTolerantHdfsAccessor {
    #[must_use]
    pub fn new(inner: Arc<dyn HdfsAccessor>, policy: Arc<RetryPolicy>) -> Self {
        Self { inner, policy }
    }

    fn retry<T>(&self, diag: &str, f: impl Fn() -> FsResult<T>) -> FsResult<T> {
        let mut op = self.policy.start_operation();
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_benign() || !op.should_retry(&format!("{diag}: {e}")) => {
                    return Err(e);
                }
                Err(_) => {
                    // Force a fresh connection before the next attempt.
                    let _ = self.inner.close_client();
                }
            }
        }
    }
}

impl HdfsAccessor for FaultTolerantHdfsAccessor {
    fn ensure_connected(&self) -> FsResult<()> {
        self.retry("connect", || self.inner.ensure_connected())
    }

    fn open_read(&self, path: &str) -> FsResult<Box<dyn ReadSeekCloser>> {
        let stream = self.retry(&format!("[{path}] open_read"), || {
            self.inner.open_read(path)
        })?;
        // The stream itself reopens and retries through the base accessor.
        Ok(Box::new(FaultTolerantReader::new(
            path.to_owned(),
            Arc::clone(&self.inner),
            Arc::clone(&self.policy),
            stream,
        )))
    }

    fn create_file(&self, path: &str, mode: u32) -> FsResult<Box<dyn HdfsWriter>> {
        // Write retries happen at the staging layer, which replays the
        // whole file; a retried create here would leave a torn stream.
        self.inner.create_file(path, mode)
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<Attrs>> {
        self.retry(&format!("[{path}] read_dir"), || self.inner.read_dir(path))
    }

    fn stat(&self, path: &str) -> FsResult<Attrs> {
        self.retry(&format!("[{path}] stat"), || self.inner.stat(path))
    }

    fn stat_fs(&self) -> FsResult<FsInfo> {
        self.retry("stat_fs", || self.inner.stat_fs())
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        self.retry(&format!("[{path}] mkdir"), || self.inner.mkdir(path, mode))
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        self.retry(&format!("[{path}] remove"), || self.inner.remove(path))
    }

    fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        self.retry(&format!("[{old_path}] rename to {new_path}"), || {
            self.inner.rename(old_path, new_path)
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        self.retry(&format!("[{path}] chmod {mode:o}"), || {
            self.inner.chmod(path, mode)
        })
    }

    fn chown(&self, path: &str, user: &str, group: &str) -> FsResult<()> {
        self.retry(&format!("[{path}] chown {user}:{group}"), || {
            self.inner.chown(path, user, group)
        })
    }

    fn close_client(&self) -> FsResult<()> {
        self.inner.close_client()
    }
}
