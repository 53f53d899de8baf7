//! Open-file handles.
//!
//! A handle's read and write sides are enabled independently and live
//! until release. All operations on one handle are serialized under a
//! single mutex, which is what lets the sequential read buffer and the
//! write stager go lock-free internally.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use hdfsfs::error::FsResult;
use hdfsfs::io::SequentialReader;

use crate::fs::file::FileNode;
use crate::fs::writer::FileHandleWriter;
use crate::fs::{FileSystem, lock};
use crate::hdfs::HdfsAccessor as _;

pub struct FileHandle {
    pub(crate) file: Arc<FileNode>,
    inner: Mutex<HandleInner>,
}

#[derive(Default)]
struct HandleInner {
    reader: Option<SequentialReader>,
    writer: Option<FileHandleWriter>,
}

impl FileHandle {
    #[must_use]
    pub fn new(file: Arc<FileNode>) -> Arc<Self> {
        Arc::new(Self {
            file,
            inner: Mutex::new(HandleInner::default()),
        })
    }

    /// Enable the read side (idempotent).
    pub fn enable_read(&self, fs: &Arc<FileSystem>) -> FsResult<()> {
        let mut inner = lock(&self.inner);
        self.enable_read_locked(fs, &mut inner)
    }

    fn enable_read_locked(&self, fs: &Arc<FileSystem>, inner: &mut HandleInner) -> FsResult<()> {
        if inner.reader.is_some() {
            return Ok(());
        }
        let stream = fs.accessor.open_read(&self.file.abs_path()?)?;
        inner.reader = Some(SequentialReader::new(stream));
        Ok(())
    }

    /// Enable the write side (idempotent). `new_file` selects
    /// create-from-scratch over buffer-existing-content.
    pub fn enable_write(&self, fs: &Arc<FileSystem>, new_file: bool) -> FsResult<()> {
        let mut inner = lock(&self.inner);
        self.enable_write_locked(fs, &mut inner, new_file)
    }

    fn enable_write_locked(
        &self,
        fs: &Arc<FileSystem>,
        inner: &mut HandleInner,
        new_file: bool,
    ) -> FsResult<()> {
        if inner.writer.is_some() {
            return Ok(());
        }
        inner.writer = Some(FileHandleWriter::new(fs, &self.file, new_file)?);
        Ok(())
    }

    /// Serve a kernel read.
    pub fn read(&self, fs: &Arc<FileSystem>, offset: u64, size: usize) -> FsResult<Bytes> {
        let mut inner = lock(&self.inner);
        if inner.reader.is_none() {
            warn!(
                path = %self.file.abs_path().unwrap_or_default(),
                offset, "reading a handle opened for write"
            );
            self.enable_read_locked(fs, &mut inner)?;
        }
        inner
            .reader
            .as_mut()
            .expect("reader enabled above")
            .read(offset, size)
    }

    /// Serve a kernel write.
    pub fn write(&self, fs: &Arc<FileSystem>, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut inner = lock(&self.inner);
        if inner.writer.is_none() {
            self.enable_write_locked(fs, &mut inner, false)?;
        }
        inner
            .writer
            .as_mut()
            .expect("writer enabled above")
            .write(fs, offset, data)
    }

    /// Push staged bytes to the store.
    pub fn flush(&self, fs: &Arc<FileSystem>) -> FsResult<()> {
        let mut inner = lock(&self.inner);
        match inner.writer.as_mut() {
            Some(writer) => writer.flush(fs, &self.file),
            None => Ok(()),
        }
    }

    /// Tear the handle down. The kernel has already flushed.
    pub fn release(&self, fs: &Arc<FileSystem>) -> FsResult<()> {
        let mut inner = lock(&self.inner);
        if let Some(mut reader) = inner.reader.take() {
            if let Err(e) = reader.close() {
                debug!(error = %e, "read-side close failed");
            }
        }
        inner.writer.take();
        drop(inner);

        self.file.remove_handle(self);
        self.file.invalidate_metadata_cache(fs);
        Ok(())
    }
}
