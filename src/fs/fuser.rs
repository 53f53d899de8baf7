//! FUSE adapter: maps [`fuser::Filesystem`] callbacks onto the node tree.
//!
//! The fuser session loop is single-threaded, so every operation is
//! bounced onto the runtime's blocking pool and replied to from there;
//! slow backend calls never stall unrelated kernel requests.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::debug;

use hdfsfs::error::{FsError, FsResult};

use crate::fs::dir::DirEntry;
use crate::fs::{FileSystem, HandleKind, Node};
use crate::hdfs::HdfsAccessor as _;

/// Kernel-side cache TTL for entries and attributes. Short: the node
/// cache underneath does the real TTL bookkeeping.
const REPLY_TTL: Duration = Duration::from_secs(1);

/// Translate an operation error to the errno handed to the kernel.
fn errno(e: &FsError) -> i32 {
    match e {
        FsError::NotFound(_) => libc::ENOENT,
        FsError::AlreadyExists(_) => libc::EEXIST,
        FsError::TooLarge => libc::ENOSPC,
        FsError::NotImplemented(_) => libc::ENOSYS,
        FsError::EndOfStream
        | FsError::Transport(_)
        | FsError::ReaderClosed
        | FsError::Internal(_)
        | FsError::Io(_) => libc::EIO,
    }
}

pub struct FuseDispatcher {
    fs: Arc<FileSystem>,
    runtime: tokio::runtime::Handle,
}

impl FuseDispatcher {
    #[must_use]
    pub fn new(fs: Arc<FileSystem>, runtime: tokio::runtime::Handle) -> Self {
        Self { fs, runtime }
    }

    fn spawn(&self, span: tracing::Span, f: impl FnOnce(Arc<FileSystem>) + Send + 'static) {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn_blocking(move || span.in_scope(|| f(fs)));
    }
}

/// Look up the node for `ino`, or reply with the right errno.
macro_rules! node_or_reply {
    ($fs:expr, $ino:expr, $reply:expr) => {
        match $fs.node($ino) {
            Some(node) => node,
            None => {
                $reply.error(libc::ENOENT);
                return;
            }
        }
    };
}

/// Unpack an operation result, or reply with its errno.
macro_rules! ok_or_reply {
    ($result:expr, $reply:expr) => {
        match $result {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "replying error");
                $reply.error(errno(&e));
                return;
            }
        }
    };
}

fn name_to_str(name: &OsStr) -> Option<String> {
    name.to_str().map(str::to_owned)
}

fn lookup_in(fs: &Arc<FileSystem>, node: &Node, name: &str) -> FsResult<Node> {
    match node {
        Node::Dir(dir) => dir.lookup(fs, name),
        Node::ZipDir(dir) => dir.lookup(fs, name),
        Node::File(_) | Node::ZipFile(_) => Err(FsError::NotFound(name.to_owned())),
    }
}

fn read_dir_of(fs: &Arc<FileSystem>, node: &Node) -> FsResult<Vec<DirEntry>> {
    match node {
        Node::Dir(dir) => dir.read_dir(fs),
        Node::ZipDir(dir) => dir.read_dir(fs),
        Node::File(_) | Node::ZipFile(_) => {
            Err(FsError::Internal("readdir on a non-directory".into()))
        }
    }
}

impl fuser::Filesystem for FuseDispatcher {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        // Writeback caching plus a modest readahead keeps the kernel's
        // request pattern close to sequential.
        let _ = config.add_capabilities(fuser::consts::FUSE_WRITEBACK_CACHE);
        let _ = config.set_max_readahead(64 * 1024);
        Ok(())
    }

    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = name_to_str(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let span = tracing::debug_span!("fuse::lookup", parent, name = %name);
        self.spawn(span, move |fs| {
            let parent = node_or_reply!(fs, parent, reply);
            let node = ok_or_reply!(lookup_in(&fs, &parent, &name), reply);
            let attrs = ok_or_reply!(node.attr(&fs), reply);
            reply.entry(&REPLY_TTL, &attrs.to_fuse(), 0);
        });
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let span = tracing::debug_span!("fuse::getattr", ino);
        self.spawn(span, move |fs| {
            let node = node_or_reply!(fs, ino, reply);
            let attrs = ok_or_reply!(node.attr(&fs), reply);
            reply.attr(&REPLY_TTL, &attrs.to_fuse());
        });
    }

    #[expect(clippy::too_many_arguments, reason = "dictated by the fuser trait")]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let span = tracing::debug_span!("fuse::setattr", ino, ?mode, ?uid);
        self.spawn(span, move |fs| {
            let node = node_or_reply!(fs, ino, reply);
            let attrs = match &node {
                Node::Dir(dir) => ok_or_reply!(dir.set_attr(&fs, mode, uid), reply),
                Node::File(file) => ok_or_reply!(file.set_attr(&fs, mode, uid), reply),
                Node::ZipDir(_) | Node::ZipFile(_) => {
                    // The archive tree is immutable.
                    reply.error(libc::EPERM);
                    return;
                }
            };
            reply.attr(&REPLY_TTL, &attrs.to_fuse());
        });
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = name_to_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!("fuse::mkdir", parent, name = %name);
        self.spawn(span, move |fs| {
            let Some(Node::Dir(dir)) = fs.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let node = ok_or_reply!(dir.mkdir(&fs, &name, mode), reply);
            let attrs = ok_or_reply!(node.attr(&fs), reply);
            reply.entry(&REPLY_TTL, &attrs.to_fuse(), 0);
        });
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let Some(name) = name_to_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!("fuse::create", parent, name = %name);
        self.spawn(span, move |fs| {
            let Some(Node::Dir(dir)) = fs.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let (node, handle) = ok_or_reply!(dir.create(&fs, &name, mode), reply);
            let attrs = ok_or_reply!(node.attr(&fs), reply);
            let fh = fs.register_handle(HandleKind::Hdfs(handle));
            reply.created(&REPLY_TTL, &attrs.to_fuse(), 0, fh, 0);
        });
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.remove_entry(parent, name, reply);
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.remove_entry(parent, name, reply);
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name_to_str(name), name_to_str(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!("fuse::rename", parent, name = %name, newparent, newname = %newname);
        self.spawn(span, move |fs| {
            let Some(Node::Dir(dir)) = fs.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let Some(Node::Dir(new_dir)) = fs.node(newparent) else {
                reply.error(libc::ENOENT);
                return;
            };
            ok_or_reply!(dir.rename(&fs, &name, &new_dir, &newname), reply);
            reply.ok();
        });
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let span = tracing::debug_span!("fuse::open", ino, flags);
        self.spawn(span, move |fs| {
            match node_or_reply!(fs, ino, reply) {
                Node::File(file) => {
                    let handle = ok_or_reply!(file.open(&fs, flags), reply);
                    let fh = fs.register_handle(HandleKind::Hdfs(handle));
                    reply.opened(fh, 0);
                }
                Node::ZipFile(file) => {
                    let handle = ok_or_reply!(file.open(), reply);
                    let fh = fs.register_handle(HandleKind::Zip(handle));
                    // Decompression cannot seek; tell the kernel so.
                    reply.opened(fh, fuser::consts::FOPEN_NONSEEKABLE);
                }
                Node::Dir(_) | Node::ZipDir(_) => reply.error(libc::EISDIR),
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "dictated by the fuser trait")]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let span = tracing::debug_span!("fuse::read", ino, fh, offset, size);
        self.spawn(span, move |fs| {
            let offset = offset.max(0) as u64;
            let size = size as usize;
            match fs.handle(fh) {
                Some(HandleKind::Hdfs(handle)) => {
                    let data = ok_or_reply!(handle.read(&fs, offset, size), reply);
                    reply.data(&data);
                }
                Some(HandleKind::Zip(handle)) => {
                    let data = ok_or_reply!(handle.read(offset, size), reply);
                    reply.data(&data);
                }
                None => reply.error(libc::EBADF),
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "dictated by the fuser trait")]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        if self.fs.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let data = data.to_vec();
        let span = tracing::debug_span!("fuse::write", ino, fh, offset, size = data.len());
        self.spawn(span, move |fs| {
            let offset = offset.max(0) as u64;
            match fs.handle(fh) {
                Some(HandleKind::Hdfs(handle)) => {
                    let written = ok_or_reply!(handle.write(&fs, offset, &data), reply);
                    reply.written(written as u32);
                }
                Some(HandleKind::Zip(_)) => reply.error(libc::EPERM),
                None => reply.error(libc::EBADF),
            }
        });
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("fuse::flush", ino, fh);
        self.spawn(span, move |fs| {
            match fs.handle(fh) {
                Some(HandleKind::Hdfs(handle)) => {
                    ok_or_reply!(handle.flush(&fs), reply);
                    reply.ok();
                }
                Some(HandleKind::Zip(_)) | None => reply.ok(),
            }
        });
    }

    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("fuse::fsync", ino);
        self.spawn(span, move |fs| {
            match fs.node(ino) {
                Some(Node::File(file)) => {
                    ok_or_reply!(file.fsync(&fs), reply);
                    reply.ok();
                }
                _ => reply.ok(),
            }
        });
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let span = tracing::debug_span!("fuse::release", ino, fh);
        self.spawn(span, move |fs| {
            match fs.take_handle(fh) {
                Some(HandleKind::Hdfs(handle)) => {
                    ok_or_reply!(handle.release(&fs), reply);
                    reply.ok();
                }
                Some(HandleKind::Zip(handle)) => {
                    ok_or_reply!(handle.release(), reply);
                    reply.ok();
                }
                None => reply.ok(),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let span = tracing::debug_span!("fuse::readdir", ino, offset);
        self.spawn(span, move |fs| {
            let node = node_or_reply!(fs, ino, reply);
            let entries = ok_or_reply!(read_dir_of(&fs, &node), reply);
            for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
                let kind = if entry.is_dir {
                    fuser::FileType::Directory
                } else {
                    fuser::FileType::RegularFile
                };
                let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                    reply.error(libc::EIO);
                    return;
                };
                if reply.add(entry.ino, next, kind, &entry.name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let span = tracing::debug_span!("fuse::statfs");
        self.spawn(span, move |fs| {
            let info = ok_or_reply!(fs.accessor.stat_fs(), reply);
            const BSIZE: u64 = 1024;
            reply.statfs(
                info.capacity / BSIZE,
                info.remaining / BSIZE,
                info.remaining / BSIZE,
                0,
                0,
                BSIZE as u32,
                255,
                BSIZE as u32,
            );
        });
    }
}

impl FuseDispatcher {
    fn remove_entry(&self, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        let Some(name) = name_to_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!("fuse::remove", parent, name = %name);
        self.spawn(span, move |fs| {
            let Some(Node::Dir(dir)) = fs.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            ok_or_reply!(dir.remove(&fs, &name), reply);
            reply.ok();
        });
    }
}
