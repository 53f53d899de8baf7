//! Directory nodes.

use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;
use tracing::debug;

use hdfsfs::clock::Clock as _;
use hdfsfs::error::{FsError, FsResult};

use crate::fs::attrs::Attrs;
use crate::hdfs::HdfsAccessor as _;
use crate::fs::file::FileNode;
use crate::fs::handle::FileHandle;
use crate::fs::zip::ZipDirNode;
use crate::fs::{ATTR_CACHE_TTL, FileSystem, Node, ROOT_INO, lock};

/// One entry a directory listing hands to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub is_dir: bool,
}

/// A cached remote directory.
pub struct DirNode {
    ino: u64,
    /// `None` for the root. Weak: children never keep parents alive.
    parent: Option<Weak<DirNode>>,
    attrs: Mutex<Attrs>,
    /// Cached children. Entries appear via lookup or readdir and leave
    /// only on remove/rename; stale attrs re-stat rather than evict.
    children: Mutex<FxHashMap<String, Node>>,
}

impl DirNode {
    pub(crate) fn new_root() -> Arc<Self> {
        Arc::new(Self {
            ino: ROOT_INO,
            parent: None,
            attrs: Mutex::new(Attrs {
                inode: ROOT_INO,
                name: String::new(),
                mode: libc::S_IFDIR | 0o755,
                ..Default::default()
            }),
            children: Mutex::new(FxHashMap::default()),
        })
    }

    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Absolute path of this directory in the remote namespace,
    /// reconstructed by walking the parent chain.
    pub fn abs_path(&self) -> FsResult<String> {
        let Some(parent) = &self.parent else {
            return Ok("/".to_owned());
        };
        let parent = parent
            .upgrade()
            .ok_or_else(|| FsError::Internal("directory detached from tree".into()))?;
        let name = lock(&self.attrs).name.clone();
        Ok(parent.path_for_child(&name))
    }

    /// Absolute path of a child of this directory.
    pub(crate) fn path_for_child(&self, name: &str) -> String {
        match self.abs_path() {
            Ok(p) if p == "/" => format!("/{name}"),
            Ok(p) => format!("{p}/{name}"),
            // An unlikely detached node; keep the name for diagnostics.
            Err(_) => format!("?/{name}"),
        }
    }

    /// Kernel attribute query: re-stat through the parent when expired.
    pub fn attr(self: &Arc<Self>, fs: &Arc<FileSystem>) -> FsResult<Attrs> {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            let expired = {
                let attrs = lock(&self.attrs);
                attrs.expired(fs.clock.now())
            };
            if expired {
                let name = lock(&self.attrs).name.clone();
                let fresh = parent.lookup_attrs(fs, &name)?;
                let mut attrs = lock(&self.attrs);
                let inode = attrs.inode;
                *attrs = fresh;
                // The kernel knows this node by its original ino.
                attrs.inode = inode;
            }
        }
        Ok(lock(&self.attrs).clone())
    }

    /// Stat one child on the backend and stamp the result with the
    /// attribute-cache TTL.
    pub(crate) fn lookup_attrs(self: &Arc<Self>, fs: &Arc<FileSystem>, name: &str) -> FsResult<Attrs> {
        let mut attrs = fs.accessor.stat(&self.path_for_child(name))?;
        attrs.name = name.to_owned();
        attrs.expires = fs.clock.now() + ATTR_CACHE_TTL;
        Ok(attrs)
    }

    /// Look up a child by name.
    pub fn lookup(self: &Arc<Self>, fs: &Arc<FileSystem>, name: &str) -> FsResult<Node> {
        let child_path = self.path_for_child(name);
        if !fs.filter.is_allowed(&child_path) {
            return Err(FsError::NotFound(child_path));
        }

        if let Some(node) = lock(&self.children).get(name) {
            return Ok(node.clone());
        }

        if fs.expand_zips && name.ends_with(".zip@") {
            return self.synthesize_zip_root(fs, name);
        }

        let attrs = self.lookup_attrs(fs, name)?;
        Ok(self.materialize(fs, attrs))
    }

    /// Present `<x>.zip` as a virtual directory named `<x>.zip@`.
    fn synthesize_zip_root(self: &Arc<Self>, fs: &Arc<FileSystem>, name: &str) -> FsResult<Node> {
        let zip_name = &name[..name.len() - 1];
        let Node::File(container) = self.lookup(fs, zip_name)? else {
            return Err(FsError::NotFound(self.path_for_child(name)));
        };
        let mut attrs = container.attrs_snapshot();
        attrs.name = name.to_owned();
        attrs.mode = (attrs.mode & 0o7777) | libc::S_IFDIR | 0o111;
        attrs.inode = fs.allocate_ino();

        let node = Node::ZipDir(ZipDirNode::new_root(container, attrs));
        lock(&self.children).insert(name.to_owned(), node.clone());
        fs.register_node(&node);
        Ok(node)
    }

    /// Create (or refresh) the typed child node for `attrs` and cache it.
    ///
    /// An existing child keeps its identity: the kernel may already hold
    /// its inode, so only the attributes are updated.
    pub(crate) fn materialize(self: &Arc<Self>, fs: &Arc<FileSystem>, mut attrs: Attrs) -> Node {
        let name = attrs.name.clone();
        let mut children = lock(&self.children);

        if let Some(existing) = children.get(&name) {
            match existing {
                Node::Dir(dir) if attrs.is_dir() => {
                    let mut cached = lock(&dir.attrs);
                    attrs.inode = cached.inode;
                    *cached = attrs;
                    return existing.clone();
                }
                Node::File(file) if !attrs.is_dir() => {
                    file.refresh_attrs(attrs);
                    return existing.clone();
                }
                // Type changed under us; fall through and replace.
                _ => {}
            }
        }

        if attrs.inode == 0 {
            attrs.inode = fs.allocate_ino();
        }
        let node = if attrs.is_dir() {
            Node::Dir(Arc::new(DirNode {
                ino: attrs.inode,
                parent: Some(Arc::downgrade(self)),
                attrs: Mutex::new(attrs),
                children: Mutex::new(FxHashMap::default()),
            }))
        } else {
            Node::File(FileNode::new(attrs, Arc::downgrade(self)))
        };
        children.insert(name, node.clone());
        drop(children);
        fs.register_node(&node);
        node
    }

    /// List this directory, speculatively caching every child so the
    /// lookups that follow an `ls` need no further backend calls.
    pub fn read_dir(self: &Arc<Self>, fs: &Arc<FileSystem>) -> FsResult<Vec<DirEntry>> {
        let path = self.abs_path()?;
        debug!(path = %path, "readdir");
        let listing = fs.accessor.read_dir(&path)?;
        let expires = fs.clock.now() + ATTR_CACHE_TTL;

        let mut entries = Vec::with_capacity(listing.len());
        for mut attrs in listing {
            if !fs.filter.is_allowed(&self.path_for_child(&attrs.name)) {
                continue;
            }
            attrs.expires = expires;
            let is_dir = attrs.is_dir();
            let name = attrs.name.clone();
            let node = self.materialize(fs, attrs);
            entries.push(DirEntry {
                ino: node.ino(),
                name: name.clone(),
                is_dir,
            });
            if fs.expand_zips && !is_dir && name.ends_with(".zip") {
                // A virtual directory next to every archive.
                entries.push(DirEntry {
                    ino: node.ino(),
                    name: format!("{name}@"),
                    is_dir: true,
                });
            }
        }
        Ok(entries)
    }

    /// Create a directory on the backend and cache the new child.
    pub fn mkdir(self: &Arc<Self>, fs: &Arc<FileSystem>, name: &str, mode: u32) -> FsResult<Node> {
        fs.accessor.mkdir(&self.path_for_child(name), mode)?;
        let attrs = Attrs {
            name: name.to_owned(),
            mode: (mode & 0o7777) | libc::S_IFDIR,
            expires: fs.clock.now() + ATTR_CACHE_TTL,
            ..Default::default()
        };
        Ok(self.materialize(fs, attrs))
    }

    /// Create a file: the node is materialized immediately and the handle
    /// comes back write-enabled.
    pub fn create(
        self: &Arc<Self>,
        fs: &Arc<FileSystem>,
        name: &str,
        mode: u32,
    ) -> FsResult<(Node, Arc<FileHandle>)> {
        let attrs = Attrs {
            name: name.to_owned(),
            mode: (mode & 0o7777) | libc::S_IFREG,
            expires: fs.clock.now() + ATTR_CACHE_TTL,
            ..Default::default()
        };
        let node = self.materialize(fs, attrs);
        let Node::File(file) = &node else {
            return Err(FsError::Internal("create materialized a directory".into()));
        };
        let handle = FileHandle::new(Arc::clone(file));
        handle.enable_write(fs, true)?;
        file.add_handle(&handle);
        Ok((node.clone(), handle))
    }

    /// Remove a child (into the trash) and evict it from the cache.
    pub fn remove(self: &Arc<Self>, fs: &Arc<FileSystem>, name: &str) -> FsResult<()> {
        fs.accessor.remove(&self.path_for_child(name))?;
        lock(&self.children).remove(name);
        Ok(())
    }

    /// Rename a child into `new_parent`. The stale source entry is
    /// evicted; the destination materializes on its next lookup.
    pub fn rename(
        self: &Arc<Self>,
        fs: &Arc<FileSystem>,
        name: &str,
        new_parent: &Arc<DirNode>,
        new_name: &str,
    ) -> FsResult<()> {
        let old_path = self.path_for_child(name);
        let new_path = new_parent.path_for_child(new_name);
        fs.accessor.rename(&old_path, &new_path)?;
        lock(&self.children).remove(name);
        Ok(())
    }

    /// Apply a setattr valid-mask: mode and uid changes reach the
    /// backend; everything else is ignored.
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

/// Shared setattr plumbing for files and directories.
pub(crate) fn apply_set_attr(
    fs: &Arc<FileSystem>,
    path: &str,
    attrs: &Mutex<Attrs>,
    mode: Option<u32>,
    uid: Option<u32>,
) -> FsResult<()> {
    if let Some(mode) = mode {
        fs.accessor.chmod(path, mode)?;
        let mut cached = lock(attrs);
        cached.mode = (cached.mode & !0o7777) | (mode & 0o7777);
    }
    if let Some(uid) = uid {
        let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
            .ok_or_else(|| FsError::NotFound(format!("uid {uid} has no user name")))?;
        // Group ownership is not mapped; everything is owned by root.
        fs.accessor.chown(path, &user, "root")?;
        lock(attrs).uid = uid;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::fs::testutil::test_fs;
    use crate::hdfs::mock::MockHdfsAccessor;

    fn dir_attrs(name: &str, perm: u32, inode: u64) -> Attrs {
        Attrs {
            inode,
            name: name.to_owned(),
            mode: libc::S_IFDIR | perm,
            ..Default::default()
        }
    }

    fn file_attrs(name: &str, size: u64, inode: u64) -> Attrs {
        Attrs {
            inode,
            name: name.to_owned(),
            mode: libc::S_IFREG | 0o644,
            size,
            ..Default::default()
        }
    }

    fn same_node(a: &Node, b: &Node) -> bool {
        match (a, b) {
            (Node::Dir(a), Node::Dir(b)) => Arc::ptr_eq(a, b),
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    #[test]
    fn attributes_are_cached_until_the_ttl_expires() {
        let mock = MockHdfsAccessor::new();
        let (fs, clock) = test_fs(&mock, "*", false);
        let root = fs.root();

        mock.expect_stat("/testDir", Ok(dir_attrs("testDir", 0o757, 42)));
        let node = root.lookup(&fs, "testDir").unwrap();
        // A second lookup must return the same entry without a stat.
        let node_again = root.lookup(&fs, "testDir").unwrap();
        assert!(same_node(&node, &node_again));
        assert_eq!(mock.stat_count.load(Ordering::Relaxed), 1);

        let attrs = node.attr(&fs).unwrap();
        assert_eq!(attrs.perm(), 0o757);

        clock.advance(Duration::from_secs(30));
        let attrs = node.attr(&fs).unwrap();
        assert_eq!(attrs.perm(), 0o757);
        assert_eq!(mock.stat_count.load(Ordering::Relaxed), 1);

        // 61 seconds in, the cache entry has expired: the next query
        // re-stats and sees the new mode.
        mock.expect_stat("/testDir", Ok(dir_attrs("testDir", 0o555, 42)));
        clock.advance(Duration::from_secs(31));
        let attrs = node.attr(&fs).unwrap();
        assert_eq!(attrs.perm(), 0o555);
        assert_eq!(mock.stat_count.load(Ordering::Relaxed), 2);

        // Expiry refreshes attrs; it never evicts the node.
        let node_after = root.lookup(&fs, "testDir").unwrap();
        assert!(same_node(&node, &node_after));
    }

    #[test]
    fn readdir_prepopulates_children_for_free_lookups() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "*", false);
        let root = fs.root();

        let listing = vec![
            dir_attrs("alpha", 0o755, 101),
            file_attrs("beta", 10, 102),
            file_attrs("gamma", 20, 103),
            dir_attrs("delta", 0o700, 104),
            file_attrs("epsilon", 30, 105),
        ];
        mock.expect_read_dir("/", Ok(listing));

        let entries = root.read_dir(&fs).unwrap();
        assert_eq!(entries.len(), 5);

        for name in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            let node = root.lookup(&fs, name).unwrap();
            let attrs = node.attr(&fs).unwrap();
            assert_eq!(attrs.name, name);
        }
        // The whole ls -l sequence cost exactly one backend call.
        assert_eq!(mock.stat_count.load(Ordering::Relaxed), 0);
        assert_eq!(mock.read_dir_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn readdir_filters_entries_through_the_prefix_gate() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "foo,bar", false);
        let root = fs.root();

        mock.expect_read_dir(
            "/",
            Ok(vec![
                dir_attrs("quz", 0o755, 201),
                dir_attrs("foo", 0o755, 202),
                dir_attrs("bar", 0o755, 203),
                dir_attrs("foobar", 0o755, 204),
                dir_attrs("baz", 0o755, 205),
            ]),
        );

        let entries = root.read_dir(&fs).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["foo", "bar"]);
    }

    #[test]
    fn lookup_outside_the_prefix_gate_is_not_found() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "foo", false);
        let root = fs.root();

        assert!(matches!(
            root.lookup(&fs, "secret"),
            Err(FsError::NotFound(_))
        ));
        // The backend never hears about denied paths.
        assert_eq!(mock.stat_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn mkdir_materializes_the_child() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "*", false);
        let root = fs.root();

        let node = root.mkdir(&fs, "fresh", 0o750).unwrap();
        assert!(matches!(node, Node::Dir(_)));
        assert_eq!(
            mock.mkdirs.lock().unwrap().as_slice(),
            [("/fresh".to_owned(), 0o750)]
        );
        // Cached: no stat on the follow-up lookup.
        let again = root.lookup(&fs, "fresh").unwrap();
        assert!(same_node(&node, &again));
        assert_eq!(mock.stat_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn rename_evicts_the_source_entry() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "*", false);
        let root = fs.root();

        mock.expect_stat("/old", Ok(file_attrs("old", 1, 301)));
        root.lookup(&fs, "old").unwrap();

        root.rename(&fs, "old", &root, "new").unwrap();
        assert_eq!(
            mock.renames.lock().unwrap().as_slice(),
            [("/old".to_owned(), "/new".to_owned())]
        );
        // The stale source entry is gone; the next lookup would re-stat.
        assert!(root.lookup(&fs, "old").is_err());
    }

    #[test]
    fn setattr_dispatches_mode_and_owner_to_the_backend() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "*", false);
        let root = fs.root();

        mock.expect_stat("/d", Ok(dir_attrs("d", 0o755, 501)));
        let Node::Dir(dir) = root.lookup(&fs, "d").unwrap() else {
            panic!("expected dir");
        };

        let attrs = dir.set_attr(&fs, Some(0o700), None).unwrap();
        assert_eq!(attrs.perm(), 0o700);
        assert_eq!(
            mock.chmods.lock().unwrap().as_slice(),
            [("/d".to_owned(), 0o700)]
        );

        // Uid 0 resolves through the host user database; the group is
        // always handed over as root.
        let attrs = dir.set_attr(&fs, None, Some(0)).unwrap();
        assert_eq!(attrs.uid, 0);
        assert_eq!(
            mock.chowns.lock().unwrap().as_slice(),
            [("/d".to_owned(), "root".to_owned(), "root".to_owned())]
        );
    }

    #[test]
    fn nested_paths_reconstruct_from_parents() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "*", false);
        let root = fs.root();

        mock.expect_stat("/a", Ok(dir_attrs("a", 0o755, 401)));
        let Node::Dir(a) = root.lookup(&fs, "a").unwrap() else {
            panic!("expected dir");
        };
        mock.expect_stat("/a/b", Ok(dir_attrs("b", 0o755, 402)));
        let Node::Dir(b) = a.lookup(&fs, "b").unwrap() else {
            panic!("expected dir");
        };
        mock.expect_stat("/a/b/c.txt", Ok(file_attrs("c.txt", 5, 403)));
        let Node::File(c) = b.lookup(&fs, "c.txt").unwrap() else {
            panic!("expected file");
        };
        assert_eq!(c.abs_path().unwrap(), "/a/b/c.txt");
        assert_eq!(b.abs_path().unwrap(), "/a/b");
        assert_eq!(root.abs_path().unwrap(), "/");
    }
}
