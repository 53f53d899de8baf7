//! Access to the remote store.
//!
//! [`HdfsAccessor`] is the boundary the filesystem layers talk through.
//! [`accessor::WebHdfsAccessor`] implements it against the wire client;
//! [`fault_tolerant::FaultTolerantHdfsAccessor`] wraps any accessor with
//! the retry policy.

pub mod accessor;
pub mod fault_tolerant;
pub mod reader;

pub use accessor::WebHdfsAccessor;
pub use fault_tolerant::FaultTolerantHdfsAccessor;

use hdfsfs::error::FsResult;
use hdfsfs::io::ReadSeekCloser;

use crate::fs::attrs::{Attrs, FsInfo};

/// A write-only stream to a file being created on the store.
///
/// Not thread safe; at most one request at a time.
pub trait HdfsWriter: Send {
    fn write(&mut self, buf: &[u8]) -> FsResult<usize>;
    fn close(&mut self) -> FsResult<()>;
}

/// Interface for accessing the remote store.
///
/// Thread safe: handles an unlimited number of concurrent requests,
/// though metadata operations are serialized internally.
pub trait HdfsAccessor: Send + Sync {
    /// Ensure a metadata connection to a name node exists.
    fn ensure_connected(&self) -> FsResult<()>;

    /// Open a file for positional reading on a dedicated connection.
    fn open_read(&self, path: &str) -> FsResult<Box<dyn ReadSeekCloser>>;

    /// Create (or overwrite) a file and return its write stream.
    fn create_file(&self, path: &str, mode: u32) -> FsResult<Box<dyn HdfsWriter>>;

    /// Enumerate a directory.
    fn read_dir(&self, path: &str) -> FsResult<Vec<Attrs>>;

    /// Retrieve attributes for one path.
    fn stat(&self, path: &str) -> FsResult<Attrs>;

    /// Retrieve store usage.
    fn stat_fs(&self) -> FsResult<FsInfo>;

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()>;

    /// Move a file or directory into the trash, mirroring the behavior of
    /// a trash-enabled shell `rm`.
    fn remove(&self, path: &str) -> FsResult<()>;

    fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()>;

    fn chmod(&self, path: &str, mode: u32) -> FsResult<()>;

    fn chown(&self, path: &str, user: &str, group: &str) -> FsResult<()>;

    /// Drop the cached metadata client so the next call reconnects.
    fn close_client(&self) -> FsResult<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! A scriptable in-memory accessor for unit tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use hdfsfs::error::{FsError, FsResult};
    use hdfsfs::io::ReadSeekCloser;

    use super::{HdfsAccessor, HdfsWriter};
    use crate::fs::attrs::{Attrs, FsInfo};

    /// Cloneable stand-in for the error kinds the mock can produce.
    #[derive(Debug, Clone)]
    pub enum MockFailure {
        NotFound,
        AlreadyExists,
        Transport(&'static str),
    }

    impl MockFailure {
        fn into_fs_error(self, path: &str) -> FsError {
            match self {
                Self::NotFound => FsError::NotFound(path.to_owned()),
                Self::AlreadyExists => FsError::AlreadyExists(path.to_owned()),
                Self::Transport(msg) => FsError::Transport(msg.to_owned()),
            }
        }
    }

    type Script<T> = Mutex<HashMap<String, VecDeque<Result<T, MockFailure>>>>;

    /// In-memory accessor; results are scripted per path and consumed in
    /// order. Unscripted calls answer *not-found*, which makes stray
    /// backend traffic show up as loud test failures.
    #[derive(Default)]
    pub struct MockHdfsAccessor {
        pub stat_script: Script<Attrs>,
        pub read_dir_script: Script<Vec<Attrs>>,
        pub open_failures: Mutex<VecDeque<MockFailure>>,
        /// Backing bytes served by `open_read` and captured by writers.
        pub files: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
        pub fs_info: Mutex<FsInfo>,

        pub stat_count: AtomicU64,
        pub read_dir_count: AtomicU64,
        pub open_read_count: AtomicU64,
        pub create_count: AtomicU64,
        pub close_client_count: AtomicU64,

        pub removes: Mutex<Vec<String>>,
        pub renames: Mutex<Vec<(String, String)>>,
        pub mkdirs: Mutex<Vec<(String, u32)>>,
        pub chmods: Mutex<Vec<(String, u32)>>,
        pub chowns: Mutex<Vec<(String, String, String)>>,
    }

    impl MockHdfsAccessor {
        pub fn new() -> Arc<Self> {
            let mock = Self {
                fs_info: Mutex::new(FsInfo {
                    capacity: u64::MAX,
                    used: 0,
                    remaining: u64::MAX,
                }),
                ..Self::default()
            };
            Arc::new(mock)
        }

        pub fn expect_stat(&self, path: &str, result: Result<Attrs, MockFailure>) {
            self.stat_script
                .lock()
                .unwrap()
                .entry(path.to_owned())
                .or_default()
                .push_back(result);
        }

        pub fn expect_read_dir(&self, path: &str, result: Result<Vec<Attrs>, MockFailure>) {
            self.read_dir_script
                .lock()
                .unwrap()
                .entry(path.to_owned())
                .or_default()
                .push_back(result);
        }

        pub fn put_file(&self, path: &str, content: Vec<u8>) {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_owned(), Arc::new(Mutex::new(content)));
        }

        pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .map(|c| c.lock().unwrap().clone())
        }

        pub fn set_fs_info(&self, info: FsInfo) {
            *self.fs_info.lock().unwrap() = info;
        }

        pub fn fail_next_open(&self, failure: MockFailure) {
            self.open_failures.lock().unwrap().push_back(failure);
        }

        fn pop_script<T>(script: &Script<T>, path: &str) -> Option<Result<T, MockFailure>> {
            script.lock().unwrap().get_mut(path)?.pop_front()
        }
    }

    impl HdfsAccessor for MockHdfsAccessor {
        fn ensure_connected(&self) -> FsResult<()> {
            Ok(())
        }

        fn open_read(&self, path: &str) -> FsResult<Box<dyn ReadSeekCloser>> {
            self.open_read_count.fetch_add(1, Ordering::Relaxed);
            if let Some(failure) = self.open_failures.lock().unwrap().pop_front() {
                return Err(failure.into_fs_error(path));
            }
            let content = self
                .files
                .lock()
                .unwrap()
                .get(path)
                .map(|c| c.lock().unwrap().clone())
                .ok_or_else(|| FsError::NotFound(path.to_owned()))?;
            Ok(Box::new(MockStream { content, pos: 0 }))
        }

        fn create_file(&self, path: &str, _mode: u32) -> FsResult<Box<dyn HdfsWriter>> {
            self.create_count.fetch_add(1, Ordering::Relaxed);
            let slot = Arc::new(Mutex::new(Vec::new()));
            self.files
                .lock()
                .unwrap()
                .insert(path.to_owned(), Arc::clone(&slot));
            Ok(Box::new(MockWriter { slot }))
        }

        fn read_dir(&self, path: &str) -> FsResult<Vec<Attrs>> {
            self.read_dir_count.fetch_add(1, Ordering::Relaxed);
            match Self::pop_script(&self.read_dir_script, path) {
                Some(Ok(attrs)) => Ok(attrs),
                Some(Err(failure)) => Err(failure.into_fs_error(path)),
                None => Err(FsError::NotFound(path.to_owned())),
            }
        }

        fn stat(&self, path: &str) -> FsResult<Attrs> {
            self.stat_count.fetch_add(1, Ordering::Relaxed);
            match Self::pop_script(&self.stat_script, path) {
                Some(Ok(attrs)) => Ok(attrs),
                Some(Err(failure)) => Err(failure.into_fs_error(path)),
                None => Err(FsError::NotFound(path.to_owned())),
            }
        }

        fn stat_fs(&self) -> FsResult<FsInfo> {
            Ok(*self.fs_info.lock().unwrap())
        }

        fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
            self.mkdirs.lock().unwrap().push((path.to_owned(), mode));
            Ok(())
        }

        fn remove(&self, path: &str) -> FsResult<()> {
            self.removes.lock().unwrap().push(path.to_owned());
            self.files.lock().unwrap().remove(path);
            Ok(())
        }

        fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
            self.renames
                .lock()
                .unwrap()
                .push((old_path.to_owned(), new_path.to_owned()));
            Ok(())
        }

        fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
            self.chmods.lock().unwrap().push((path.to_owned(), mode));
            Ok(())
        }

        fn chown(&self, path: &str, user: &str, group: &str) -> FsResult<()> {
            self.chowns.lock().unwrap().push((
                path.to_owned(),
                user.to_owned(),
                group.to_owned(),
            ));
            Ok(())
        }

        fn close_client(&self) -> FsResult<()> {
            self.close_client_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct MockStream {
        content: Vec<u8>,
        pos: u64,
    }

    impl ReadSeekCloser for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
            let pos = self.pos as usize;
            if pos >= self.content.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.content.len() - pos);
            buf[..n].copy_from_slice(&self.content[pos..pos + n]);
            self.pos += n as u64;
            Ok(n)
        }

        fn seek(&mut self, pos: u64) -> FsResult<()> {
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

    struct MockWriter {
        slot: Arc<Mutex<Vec<u8>>>,
    }

    impl HdfsWriter for MockWriter {
        fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
            self.slot.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn close(&mut self) -> FsResult<()> {
            Ok(())
        }
    }
}
