//! The cached filesystem tree.
//!
//! Nodes are materialized from name-node metadata on first lookup or
//! directory listing and live until removed, renamed, or unmounted.
//! Ownership flows strictly downward (directories own their children);
//! upward references for path reconstruction are weak.
//!
//! The kernel addresses nodes by inode number, so the tree is paired
//! with a registry mapping inos to nodes. Remote nodes use the name
//! node's stable file id; synthesized nodes (archive members, virtual
//! archive roots) draw from a private high range.

pub mod attrs;
pub mod dir;
pub mod file;
pub mod fuser;
pub mod handle;
pub mod writer;
pub mod zip;
pub mod zip_handle;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;

use hdfsfs::clock::Clock;
use hdfsfs::error::FsResult;
use hdfsfs::filter::PathFilter;
use hdfsfs::io::RandomAccessReader;
use hdfsfs::retry::RetryPolicy;

use crate::fs::attrs::Attrs;
use crate::fs::dir::DirNode;
use crate::fs::file::FileNode;
use crate::fs::handle::FileHandle;
use crate::fs::zip::{ZipDirNode, ZipFileNode};
use crate::fs::zip_handle::ZipFileHandle;
use crate::hdfs::HdfsAccessor;

/// The kernel's fixed root inode number.
pub const ROOT_INO: u64 = 1;

/// How long cached node attributes stay authoritative.
pub const ATTR_CACHE_TTL: Duration = Duration::from_secs(60);

/// First inode id handed to nodes with no backend identity.
const SYNTHETIC_INO_BASE: u64 = 1 << 62;

/// One node of the cached tree.
#[derive(Clone)]
pub enum Node {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
    ZipDir(Arc<ZipDirNode>),
    ZipFile(Arc<ZipFileNode>),
}

impl Node {
    #[must_use]
    pub fn ino(&self) -> u64 {
        match self {
            Self::Dir(n) => n.ino(),
            Self::File(n) => n.ino(),
            Self::ZipDir(n) => n.ino(),
            Self::ZipFile(n) => n.ino(),
        }
    }

    /// Current attributes, re-statting through the parent when the cache
    /// entry has expired. Archive nodes are immutable and never re-stat.
    pub fn attr(&self, fs: &Arc<FileSystem>) -> FsResult<Attrs> {
        match self {
            Self::Dir(n) => n.attr(fs),
            Self::File(n) => n.attr(fs),
            Self::ZipDir(n) => Ok(n.attrs().clone()),
            Self::ZipFile(n) => Ok(n.attrs().clone()),
        }
    }
}

/// An open handle as tracked by the kernel-facing handle table.
#[derive(Clone)]
pub enum HandleKind {
    Hdfs(Arc<FileHandle>),
    Zip(Arc<ZipFileHandle>),
}

/// Everything one mount needs: configuration, the accessor stack, the
/// node tree, and the open-handle table.
pub struct FileSystem {
    pub(crate) accessor: Arc<dyn HdfsAccessor>,
    pub(crate) filter: PathFilter,
    pub(crate) expand_zips: bool,
    pub(crate) read_only: bool,
    pub(crate) retry_policy: Arc<RetryPolicy>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) staging_dir: PathBuf,

    root: Mutex<Option<Arc<DirNode>>>,
    nodes: Mutex<FxHashMap<u64, Node>>,
    next_synthetic_ino: AtomicU64,

    next_fh: AtomicU64,
    handles: Mutex<FxHashMap<u64, HandleKind>>,

    /// Long-lived readers (archive backing streams) torn down at unmount.
    close_on_unmount: Mutex<Vec<Arc<RandomAccessReader>>>,
}

impl FileSystem {
    #[expect(clippy::too_many_arguments, reason = "assembled once, in the daemon")]
    pub fn new(
        accessor: Arc<dyn HdfsAccessor>,
        filter: PathFilter,
        expand_zips: bool,
        read_only: bool,
        retry_policy: Arc<RetryPolicy>,
        clock: Arc<dyn Clock>,
        staging_dir: PathBuf,
    ) -> Arc<Self> {
        let fs = Arc::new(Self {
            accessor,
            filter,
            expand_zips,
            read_only,
            retry_policy,
            clock,
            staging_dir,
            root: Mutex::new(None),
            nodes: Mutex::new(FxHashMap::default()),
            next_synthetic_ino: AtomicU64::new(SYNTHETIC_INO_BASE),
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(FxHashMap::default()),
            close_on_unmount: Mutex::new(Vec::new()),
        });

        let root = DirNode::new_root();
        fs.register_node(&Node::Dir(Arc::clone(&root)));
        *lock(&fs.root) = Some(root);
        fs
    }

    /// The root directory node.
    #[must_use]
    pub fn root(&self) -> Arc<DirNode> {
        lock(&self.root).clone().expect("root set at construction")
    }

    /// Resolve a kernel inode number.
    #[must_use]
    pub fn node(&self, ino: u64) -> Option<Node> {
        lock(&self.nodes).get(&ino).cloned()
    }

    pub(crate) fn register_node(&self, node: &Node) {
        lock(&self.nodes).insert(node.ino(), node.clone());
    }

    /// Allocate an inode id for a node the backend has no id for.
    pub(crate) fn allocate_ino(&self) -> u64 {
        self.next_synthetic_ino.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_handle(&self, handle: HandleKind) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        lock(&self.handles).insert(fh, handle);
        fh
    }

    #[must_use]
    pub fn handle(&self, fh: u64) -> Option<HandleKind> {
        lock(&self.handles).get(&fh).cloned()
    }

    pub(crate) fn take_handle(&self, fh: u64) -> Option<HandleKind> {
        lock(&self.handles).remove(&fh)
    }

    /// Register a resource to be closed when the filesystem unmounts.
    pub(crate) fn register_close_on_unmount(&self, reader: Arc<RandomAccessReader>) {
        lock(&self.close_on_unmount).push(reader);
    }

    /// Close everything in the close-on-unmount set. Called exactly once
    /// from the unmount path.
    pub fn close_registered(&self) {
        let readers = std::mem::take(&mut *lock(&self.close_on_unmount));
        for reader in readers {
            if let Err(e) = reader.close() {
                tracing::warn!(error = %e, "close-on-unmount resource failed to close");
            }
        }
    }
}

/// Locks in this crate are held for map-sized critical sections only; a
/// poisoned one means a panic mid-insert, which is safe to continue past.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
