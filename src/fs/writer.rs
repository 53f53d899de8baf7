//! The write stager.
//!
//! The store cannot write at an offset, so writes land in a local staging
//! file and a flush rewrites the remote file from scratch. The staging
//! file is an anonymous temp file: it has no directory entry, so the OS
//! reclaims it the moment the handle closes, crash included.

use std::os::unix::fs::{FileExt as _, PermissionsExt as _};
use std::sync::Arc;

use tracing::{debug, info, warn};

use hdfsfs::error::{FsError, FsResult};

use crate::fs::FileSystem;
use crate::fs::file::FileNode;
use crate::hdfs::HdfsAccessor as _;

/// Chunk size for staging-to-store streaming.
const COPY_CHUNK: usize = 64 * 1024;

pub struct FileHandleWriter {
    path: String,
    mode: u32,
    staging: std::fs::File,
    bytes_written: u64,
}

impl FileHandleWriter {
    /// Set up a write session for `file`.
    ///
    /// A new file is created on the store right away (remove-then-create,
    /// so retried creates are idempotent) and the placeholder closed. For
    /// an existing file the current content is buffered into the staging
    /// file first, since the flush will rewrite all of it.
    pub(crate) fn new(
        fs: &Arc<FileSystem>,
        file: &Arc<FileNode>,
        new_file: bool,
    ) -> FsResult<Self> {
        let path = file.abs_path()?;
        let mode = file.attrs_snapshot().mode;
        debug!(path = %path, new_file, "starting write session");

        if new_file {
            let _ = fs.accessor.remove(&path);
            let mut placeholder = fs.accessor.create_file(&path, mode)?;
            placeholder.close()?;
        }

        std::fs::create_dir_all(&fs.staging_dir)?;
        std::fs::set_permissions(&fs.staging_dir, std::fs::Permissions::from_mode(0o700))?;
        let staging = tempfile::tempfile_in(&fs.staging_dir)?;

        let mut writer = Self {
            path,
            mode,
            staging,
            bytes_written: 0,
        };

        if !new_file {
            // The file must exist before we promise to rewrite it.
            fs.accessor.stat(&writer.path)?;
            writer.buffer_existing(fs)?;
        }
        Ok(writer)
    }

    /// Stream the file's current content into the staging file.
    fn buffer_existing(&mut self, fs: &Arc<FileSystem>) -> FsResult<()> {
        let mut stream = fs.accessor.open_read(&self.path)?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut offset = 0u64;
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.staging.write_all_at(&buf[..n], offset)?;
            offset += n as u64;
        }
        let _ = stream.close();
        debug!(path = %self.path, bytes = offset, "buffered existing content");
        Ok(())
    }

    /// Stage one kernel write.
    pub(crate) fn write(
        &mut self,
        fs: &Arc<FileSystem>,
        offset: u64,
        data: &[u8],
    ) -> FsResult<usize> {
        // Guard against filling the store: the flush will need at least
        // this much room.
        let fs_info = fs.accessor.stat_fs()?;
        if offset >= fs_info.remaining {
            warn!(
                path = %self.path,
                offset,
                remaining = fs_info.remaining,
                "write exceeds remaining store capacity"
            );
            return Err(FsError::TooLarge);
        }
        self.staging.write_all_at(data, offset)?;
        self.bytes_written += data.len() as u64;
        Ok(data.len())
    }

    /// Rewrite the remote file from the staging file, retrying whole
    /// attempts under the policy. The file's attribute cache is
    /// invalidated on every exit path so size and mtime re-stat.
    pub(crate) fn flush(&mut self, fs: &Arc<FileSystem>, file: &Arc<FileNode>) -> FsResult<()> {
        if self.bytes_written == 0 {
            return Ok(());
        }
        info!(path = %self.path, bytes = self.bytes_written, "flushing");
        self.bytes_written = 0;

        let mut op = fs.retry_policy.start_operation();
        let result = loop {
            match self.flush_attempt(fs) {
                Ok(()) => break Ok(()),
                Err(e)
                    if e.is_benign()
                        || !op.should_retry(&format!("[{}] flush: {e}", self.path)) =>
                {
                    break Err(e);
                }
                Err(_) => {
                    // Force a reconnect before replaying the file.
                    let _ = fs.accessor.close_client();
                }
            }
        };

        file.invalidate_metadata_cache(fs);
        result
    }

    /// One whole-file rewrite: remove, create, stream, close.
    fn flush_attempt(&mut self, fs: &Arc<FileSystem>) -> FsResult<()> {
        let _ = fs.accessor.remove(&self.path);
        let mut writer = fs.accessor.create_file(&self.path, self.mode)?;

        let mut buf = vec![0u8; COPY_CHUNK];
        let mut offset = 0u64;
        loop {
            let n = match self.staging.read_at(&mut buf, offset) {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.close();
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.write(&buf[..n]) {
                let _ = writer.close();
                return Err(e);
            }
            offset += n as u64;
        }
        writer.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hdfsfs::error::FsError;

    use crate::fs::attrs::{Attrs, FsInfo};
    use crate::fs::testutil::test_fs as make_test_fs;
    use crate::fs::{FileSystem, Node};
    use crate::hdfs::mock::MockHdfsAccessor;

    fn test_fs(mock: &Arc<MockHdfsAccessor>) -> Arc<FileSystem> {
        make_test_fs(mock, "*", false).0
    }

    fn file_attrs(name: &str, size: u64) -> Attrs {
        Attrs {
            inode: 0,
            name: name.to_owned(),
            mode: libc::S_IFREG | 0o644,
            size,
            ..Default::default()
        }
    }

    #[test]
    fn staged_writes_round_trip_through_flush() {
        let mock = MockHdfsAccessor::new();
        let fs = test_fs(&mock);
        let root = fs.root();

        let (_, handle) = root.create(&fs, "out.bin", 0o644).unwrap();
        handle.write(&fs, 0, b"hello ").unwrap();
        handle.write(&fs, 6, b"world").unwrap();
        // An overwrite in the middle, as the kernel may reorder.
        handle.write(&fs, 0, b"HELLO").unwrap();
        handle.flush(&fs).unwrap();

        assert_eq!(mock.file_content("/out.bin").unwrap(), b"HELLO world");

        // Reopening for read serves the flushed bytes.
        let node = root.lookup(&fs, "out.bin").unwrap();
        let Node::File(file) = node else {
            panic!("expected a file node")
        };
        let read_handle = file.open(&fs, libc::O_RDONLY).unwrap();
        let data = read_handle.read(&fs, 0, 64).unwrap();
        assert_eq!(data.as_ref(), b"HELLO world");
        read_handle.release(&fs).unwrap();
        handle.release(&fs).unwrap();
    }

    #[test]
    fn write_size_guard_reports_too_large() {
        let mock = MockHdfsAccessor::new();
        mock.set_fs_info(FsInfo {
            capacity: 100,
            used: 95,
            remaining: 5,
        });
        let fs = test_fs(&mock);
        let root = fs.root();

        let (_, handle) = root.create(&fs, "big.bin", 0o644).unwrap();
        let err = handle.write(&fs, 11, b"x").unwrap_err();
        assert!(matches!(err, FsError::TooLarge));
    }

    #[test]
    fn flush_with_no_bytes_written_is_a_no_op() {
        let mock = MockHdfsAccessor::new();
        mock.put_file("/existing", b"untouched".to_vec());
        mock.expect_stat("/existing", Ok(file_attrs("existing", 9)));
        let fs = test_fs(&mock);
        let root = fs.root();

        // Materialize the node, then open for write without writing.
        mock.expect_stat("/existing", Ok(file_attrs("existing", 9)));
        let Node::File(file) = root.lookup(&fs, "existing").unwrap() else {
            panic!("expected file");
        };
        let handle = file.open(&fs, libc::O_WRONLY | libc::O_APPEND).unwrap();
        let creates_before = mock.create_count.load(std::sync::atomic::Ordering::Relaxed);
        handle.flush(&fs).unwrap();
        assert_eq!(
            mock.create_count.load(std::sync::atomic::Ordering::Relaxed),
            creates_before
        );
        assert_eq!(mock.file_content("/existing").unwrap(), b"untouched");
        handle.release(&fs).unwrap();
    }

    #[test]
    fn trash_shell_remove_renames_instead_of_deleting() {
        let mock = MockHdfsAccessor::new();
        let fs = test_fs(&mock);
        let root = fs.root();
        mock.expect_stat("/doomed", Ok(file_attrs("doomed", 3)));
        root.lookup(&fs, "doomed").unwrap();

        root.remove(&fs, "doomed").unwrap();
        // The mock's `remove` stands in for the trash move; the child
        // must be evicted so the next lookup re-stats.
        assert_eq!(mock.removes.lock().unwrap().as_slice(), ["/doomed"]);
        assert!(root.lookup(&fs, "doomed").is_err());
    }
}
