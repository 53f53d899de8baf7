//! File nodes.

use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use hdfsfs::clock::Clock as _;
use hdfsfs::error::{FsError, FsResult};
use hdfsfs::io::{ReadSeekCloser, ReadSeekCloserFactory};

use crate::fs::attrs::Attrs;
use crate::fs::dir::{DirNode, apply_set_attr};
use crate::fs::handle::FileHandle;
use crate::fs::{FileSystem, lock};

/// A cached remote file.
pub struct FileNode {
    ino: u64,
    parent: Weak<DirNode>,
    attrs: Mutex<Attrs>,
    /// Handles currently open on this file.
    handles: Mutex<Vec<Arc<FileHandle>>>,
}

impl FileNode {
    pub(crate) fn new(attrs: Attrs, parent: Weak<DirNode>) -> Arc<Self> {
        Arc::new(Self {
            ino: attrs.inode,
            parent,
            attrs: Mutex::new(attrs),
            handles: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    #[must_use]
    pub fn attrs_snapshot(&self) -> Attrs {
        lock(&self.attrs).clone()
    }

    pub(crate) fn refresh_attrs(&self, mut attrs: Attrs) {
        let mut cached = lock(&self.attrs);
        attrs.inode = cached.inode;
        *cached = attrs;
    }

    /// Absolute path in the remote namespace.
    pub fn abs_path(&self) -> FsResult<String> {
        let parent = self
            .parent
            .upgrade()
            .ok_or_else(|| FsError::Internal("file detached from tree".into()))?;
        let name = lock(&self.attrs).name.clone();
        Ok(parent.path_for_child(&name))
    }

    /// Kernel attribute query: re-stat through the parent when expired.
    pub fn attr(self: &Arc<Self>, fs: &Arc<FileSystem>) -> FsResult<Attrs> {
        let expired = lock(&self.attrs).expired(fs.clock.now());
        if expired {
            let parent = self
                .parent
                .upgrade()
                .ok_or_else(|| FsError::Internal("file detached from tree".into()))?;
            let name = lock(&self.attrs).name.clone();
            let fresh = parent.lookup_attrs(fs, &name)?;
            self.refresh_attrs(fresh);
        }
        Ok(lock(&self.attrs).clone())
    }

    /// Open a handle per the kernel's access mode: reads are enabled for
    /// read and read-write opens; writes eagerly only for write-only
    /// opens (append never treats the file as new), lazily otherwise.
    pub fn open(self: &Arc<Self>, fs: &Arc<FileSystem>, flags: i32) -> FsResult<Arc<FileHandle>> {
        debug!(path = %self.abs_path().unwrap_or_default(), flags, "open");
        let handle = FileHandle::new(Arc::clone(self));
        let access = flags & libc::O_ACCMODE;
        if access == libc::O_RDONLY || access == libc::O_RDWR {
            handle.enable_read(fs)?;
        }
        if access == libc::O_WRONLY {
            let new_file = flags & libc::O_APPEND == 0;
            handle.enable_write(fs, new_file)?;
        }
        self.add_handle(&handle);
        Ok(handle)
    }

    pub(crate) fn add_handle(&self, handle: &Arc<FileHandle>) {
        lock(&self.handles).push(Arc::clone(handle));
    }

    pub(crate) fn remove_handle(&self, handle: &FileHandle) {
        lock(&self.handles).retain(|h| !std::ptr::eq(h.as_ref(), handle));
    }

    fn active_handles(&self) -> Vec<Arc<FileHandle>> {
        lock(&self.handles).clone()
    }

    /// Fsync dispatches to every live handle of the file.
    pub fn fsync(self: &Arc<Self>, fs: &Arc<FileSystem>) -> FsResult<()> {
        let handles = self.active_handles();
        debug!(count = handles.len(), "fsync dispatch");
        let mut result = Ok(());
        for handle in handles {
            if let Err(e) = handle.flush(fs) {
                result = Err(e);
            }
        }
        result
    }

    /// Force a re-stat on the next attribute query, so size and mtime
    /// reflect a completed write.
    pub(crate) fn invalidate_metadata_cache(&self, fs: &Arc<FileSystem>) {
        lock(&self.attrs).invalidate(fs.clock.now());
    }

    pub fn set_attr(
        self: &Arc<Self>,
        fs: &Arc<FileSystem>,
        mode: Option<u32>,
        uid: Option<u32>,
    ) -> FsResult<Attrs> {
        let path = self.abs_path()?;
        apply_set_attr(fs, &path, &self.attrs, mode, uid)?;
        Ok(lock(&self.attrs).clone())
    }
}

/// Opens buffered read streams over one file, for the reader pool.
pub(crate) struct FileStreamFactory {
    pub(crate) fs: Weak<FileSystem>,
    pub(crate) file: Arc<FileNode>,
}

impl ReadSeekCloserFactory for FileStreamFactory {
    fn open_read(&self) -> FsResult<Box<dyn ReadSeekCloser>> {
        let fs = self
            .fs
            .upgrade()
            .ok_or(FsError::ReaderClosed)?;
        let handle = FileHandle::new(Arc::clone(&self.file));
        handle.enable_read(&fs)?;
        self.file.add_handle(&handle);
        Ok(Box::new(HandleStream {
            fs: Weak::clone(&self.fs),
            handle,
            offset: 0,
        }))
    }
}

/// Exposes a [`FileHandle`] as a positional stream, so pooled readers get
/// the handle-level fragment cache for free.
struct HandleStream {
    fs: Weak<FileSystem>,
    handle: Arc<FileHandle>,
    offset: u64,
}

impl ReadSeekCloser for HandleStream {
    fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let fs = self.fs.upgrade().ok_or(FsError::ReaderClosed)?;
        let data = self.handle.read(&fs, self.offset, buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        self.offset += data.len() as u64;
        Ok(data.len())
    }

    fn seek(&mut self, pos: u64) -> FsResult<()> {
        // Virtual; the handle's buffer decides between hole and seek.
        self.offset = pos;
        Ok(())
    }

    fn position(&mut self) -> FsResult<u64> {
        Ok(self.offset)
    }

    fn close(&mut self) -> FsResult<()> {
        let Some(fs) = self.fs.upgrade() else {
            return Ok(());
        };
        self.handle.release(&fs)
    }
}
