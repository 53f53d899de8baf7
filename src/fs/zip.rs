//! ZIP archives presented as virtual directory trees.
//!
//! Looking up `<name>.zip@` synthesizes an archive root over the
//! `<name>.zip` file node. The central directory is parsed once, through
//! a pooled random-access reader over the remote file; after that the
//! in-memory tree is immutable and reads need no locks.

use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use tracing::{error, info};
use zip::ZipArchive;

use hdfsfs::error::{FsError, FsResult};
use hdfsfs::io::RandomAccessReader;

use crate::fs::attrs::Attrs;
use crate::fs::dir::DirEntry;
use crate::fs::file::{FileNode, FileStreamFactory};
use crate::fs::zip_handle::ZipFileHandle;
use crate::fs::{FileSystem, Node, lock};

/// Archive backing readers are capped lower than plain file readers;
/// central-directory access is bursty but narrow.
const ARCHIVE_MAX_READERS: usize = 100;

/// A directory inside (or the root of) an expanded archive.
pub struct ZipDirNode {
    ino: u64,
    attrs: Attrs,
    /// Set during parsing; immutable afterwards.
    children: OnceLock<ZipChildren>,
    /// Present only on the archive root.
    root: Option<RootState>,
}

struct RootState {
    container: Arc<FileNode>,
    /// Guards first-access parsing; double-checked against `children`.
    init_lock: Mutex<()>,
}

pub(crate) struct ZipChildren {
    subdirs: FxHashMap<String, Arc<ZipDirNode>>,
    files: FxHashMap<String, Arc<ZipFileNode>>,
}

/// A file entry inside an expanded archive.
pub struct ZipFileNode {
    ino: u64,
    attrs: Attrs,
    /// Cloneable handle on the parsed archive; each open clones it so
    /// decompression streams are independent.
    archive: ZipArchive<ZipStreamAdapter>,
    index: usize,
}

impl ZipDirNode {
    pub(crate) fn new_root(container: Arc<FileNode>, attrs: Attrs) -> Arc<Self> {
        Arc::new(Self {
            ino: attrs.inode,
            attrs,
            children: OnceLock::new(),
            root: Some(RootState {
                container,
                init_lock: Mutex::new(()),
            }),
        })
    }

    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    #[must_use]
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// The parsed tree, parsing on first access for the root.
    fn children(&self, fs: &Arc<FileSystem>) -> FsResult<&ZipChildren> {
        if let Some(children) = self.children.get() {
            return Ok(children);
        }
        let Some(root) = &self.root else {
            // Inner directories are born with their tree in place.
            return Err(FsError::Internal("archive directory without a tree".into()));
        };

        let _guard = lock(&root.init_lock);
        if let Some(children) = self.children.get() {
            return Ok(children);
        }
        let children = self.parse_archive(fs, root)?;
        Ok(self.children.get_or_init(|| children))
    }

    /// Read the central directory and pre-create the whole subtree.
    fn parse_archive(&self, fs: &Arc<FileSystem>, root: &RootState) -> FsResult<ZipChildren> {
        let path = root.container.abs_path()?;
        let factory = Arc::new(FileStreamFactory {
            fs: Arc::downgrade(fs),
            file: Arc::clone(&root.container),
        });
        let reader = Arc::new(RandomAccessReader::with_max_readers(
            factory,
            ARCHIVE_MAX_READERS,
        ));
        let size = root.container.attr(fs)?.size;

        let adapter = ZipStreamAdapter {
            reader: Arc::clone(&reader),
            size,
            pos: 0,
        };
        let archive = match ZipArchive::new(adapter) {
            Ok(archive) => {
                info!(path = %path, "opened archive");
                archive
            }
            Err(e) => {
                error!(path = %path, error = %e, "opening archive failed");
                return Err(FsError::Transport(format!("opening archive {path}: {e}")));
            }
        };
        // The backing reader lives as long as the mount.
        fs.register_close_on_unmount(reader);

        let mut archive = archive;
        let mut raw_entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive
                .by_index(index)
                .map_err(|e| FsError::Transport(format!("reading archive {path}: {e}")))?;
            raw_entries.push(RawEntry {
                name: entry.name().to_owned(),
                size: entry.size(),
                mode: entry.unix_mode(),
                mtime: zip_entry_time(entry.last_modified()),
                is_dir: entry.is_dir(),
                index,
            });
        }

        let mut builder = DirBuilder::default();
        for raw in raw_entries {
            builder.insert(&raw, &self.attrs);
        }
        Ok(builder.freeze(fs, &archive, &self.attrs))
    }

    pub fn lookup(&self, fs: &Arc<FileSystem>, name: &str) -> FsResult<Node> {
        let children = self.children(fs)?;
        if let Some(dir) = children.subdirs.get(name) {
            return Ok(Node::ZipDir(Arc::clone(dir)));
        }
        if let Some(file) = children.files.get(name) {
            return Ok(Node::ZipFile(Arc::clone(file)));
        }
        Err(FsError::NotFound(format!("{}/{name}", self.attrs.name)))
    }

    pub fn read_dir(&self, fs: &Arc<FileSystem>) -> FsResult<Vec<DirEntry>> {
        let children = self.children(fs)?;
        let mut entries = Vec::with_capacity(children.subdirs.len() + children.files.len());
        for (name, dir) in &children.subdirs {
            entries.push(DirEntry {
                ino: dir.ino,
                name: name.clone(),
                is_dir: true,
            });
        }
        for (name, file) in &children.files {
            entries.push(DirEntry {
                ino: file.ino,
                name: name.clone(),
                is_dir: false,
            });
        }
        Ok(entries)
    }
}

impl ZipFileNode {
    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    #[must_use]
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// Open a sequential decompression stream over this entry.
    pub fn open(&self) -> FsResult<Arc<ZipFileHandle>> {
        ZipFileHandle::spawn(self.archive.clone(), self.index)
    }
}

struct RawEntry {
    name: String,
    size: u64,
    mode: Option<u32>,
    mtime: SystemTime,
    is_dir: bool,
    index: usize,
}

/// Mutable tree under construction; frozen into `ZipChildren` once the
/// whole central directory has been walked.
#[derive(Default)]
struct DirBuilder {
    attrs: Option<Attrs>,
    subdirs: FxHashMap<String, DirBuilder>,
    files: FxHashMap<String, (Attrs, usize)>,
}

impl DirBuilder {
    /// Walk the entry's path components, creating intermediate
    /// directories on demand.
    fn insert(&mut self, raw: &RawEntry, root_attrs: &Attrs) {
        let components: Vec<&str> = raw.name.split('/').filter(|c| !c.is_empty()).collect();
        let mut dir = self;
        for (i, component) in components.iter().enumerate() {
            let last = i == components.len() - 1;
            if last && !raw.is_dir {
                dir.files.insert(
                    (*component).to_owned(),
                    (entry_attrs(raw, component, root_attrs, false), raw.index),
                );
                return;
            }
            let sub = dir.subdirs.entry((*component).to_owned()).or_default();
            if last {
                sub.attrs = Some(entry_attrs(raw, component, root_attrs, true));
            }
            dir = sub;
        }
    }

    fn freeze(
        self,
        fs: &Arc<FileSystem>,
        archive: &ZipArchive<ZipStreamAdapter>,
        root_attrs: &Attrs,
    ) -> ZipChildren {
        let mut subdirs = FxHashMap::default();
        for (name, sub) in self.subdirs {
            let mut attrs = sub.attrs.clone().unwrap_or_else(|| Attrs {
                name: name.clone(),
                mode: libc::S_IFDIR | 0o755,
                uid: root_attrs.uid,
                gid: root_attrs.gid,
                mtime: root_attrs.mtime,
                ctime: root_attrs.mtime,
                crtime: root_attrs.mtime,
                expires: far_future(),
                ..Default::default()
            });
            attrs.inode = fs.allocate_ino();
            let children = sub.freeze(fs, archive, root_attrs);
            let node = Arc::new(ZipDirNode {
                ino: attrs.inode,
                attrs,
                children: {
                    let cell = OnceLock::new();
                    let _ = cell.set(children);
                    cell
                },
                root: None,
            });
            fs.register_node(&Node::ZipDir(Arc::clone(&node)));
            subdirs.insert(name, node);
        }

        let mut files = FxHashMap::default();
        for (name, (mut attrs, index)) in self.files {
            attrs.inode = fs.allocate_ino();
            let node = Arc::new(ZipFileNode {
                ino: attrs.inode,
                attrs,
                archive: archive.clone(),
                index,
            });
            fs.register_node(&Node::ZipFile(Arc::clone(&node)));
            files.insert(name, node);
        }

        ZipChildren { subdirs, files }
    }
}

fn entry_attrs(raw: &RawEntry, name: &str, root_attrs: &Attrs, dir: bool) -> Attrs {
    let perm = raw.mode.map_or(if dir { 0o755 } else { 0o644 }, |m| m & 0o7777);
    let type_bit = if dir { libc::S_IFDIR } else { libc::S_IFREG };
    Attrs {
        inode: 0,
        name: name.to_owned(),
        mode: perm | type_bit,
        size: if dir { 0 } else { raw.size },
        uid: root_attrs.uid,
        gid: root_attrs.gid,
        mtime: raw.mtime,
        ctime: raw.mtime,
        crtime: raw.mtime,
        expires: far_future(),
    }
}

/// Archive attributes never expire; the tree is immutable.
fn far_future() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u32::MAX as u64)
}

fn zip_entry_time(dt: Option<zip::DateTime>) -> SystemTime {
    let Some(dt) = dt else {
        return UNIX_EPOCH;
    };
    let days = days_from_civil(i64::from(dt.year()), i64::from(dt.month()), i64::from(dt.day()));
    let secs = days * 86_400
        + i64::from(dt.hour()) * 3_600
        + i64::from(dt.minute()) * 60
        + i64::from(dt.second());
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Adapts the pooled reader into the `Read + Seek` pair the archive
/// parser wants. Clones share the pool but carry their own cursor.
#[derive(Clone)]
pub(crate) struct ZipStreamAdapter {
    reader: Arc<RandomAccessReader>,
    size: u64,
    pos: u64,
}

impl Read for ZipStreamAdapter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self
            .reader
            .read_at(buf, self.pos)
            .map_err(std::io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ZipStreamAdapter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => i64::try_from(p).unwrap_or(i64::MAX),
            SeekFrom::End(delta) => i64::try_from(self.size).unwrap_or(i64::MAX) + delta,
            SeekFrom::Current(delta) => i64::try_from(self.pos).unwrap_or(i64::MAX) + delta,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of archive",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_day_arithmetic() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(1970, 1, 2), 1);
        assert_eq!(days_from_civil(1969, 12, 31), -1);
        assert_eq!(days_from_civil(2000, 3, 1), 11017);
    }
}

#[cfg(test)]
mod zip_tests {
    use std::io::Write as _;
    use std::sync::Arc;

    use zip::write::SimpleFileOptions;

    use super::*;
    use crate::fs::testutil::test_fs;
    use crate::fs::{FileSystem, Node};
    use crate::hdfs::mock::MockHdfsAccessor;

    fn entry_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// foo/a (1234), foo/baz/x/y/z/w (256), foo/b (4321),
    /// foo/bar/c (256), qux (1024).
    fn build_test_zip() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let dir_opts = SimpleFileOptions::default();
        let file_opts = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        writer.add_directory("foo/", dir_opts).unwrap();
        writer.start_file("foo/a", file_opts).unwrap();
        writer.write_all(&entry_content(1234)).unwrap();
        writer.add_directory("foo/baz/", dir_opts).unwrap();
        writer.add_directory("foo/baz/x/", dir_opts).unwrap();
        writer.add_directory("foo/baz/x/y/", dir_opts).unwrap();
        writer.add_directory("foo/baz/x/y/z/", dir_opts).unwrap();
        writer.start_file("foo/baz/x/y/z/w", file_opts).unwrap();
        writer.write_all(&entry_content(256)).unwrap();
        writer.start_file("foo/b", file_opts).unwrap();
        writer.write_all(&entry_content(4321)).unwrap();
        writer.add_directory("foo/bar/", dir_opts).unwrap();
        writer.start_file("foo/bar/c", file_opts).unwrap();
        writer.write_all(&entry_content(256)).unwrap();
        writer.start_file("qux", file_opts).unwrap();
        writer.write_all(&entry_content(1024)).unwrap();

        writer.finish().unwrap().into_inner()
    }

    fn mounted_archive() -> (Arc<FileSystem>, Arc<MockHdfsAccessor>, Arc<ZipDirNode>) {
        let bytes = build_test_zip();
        let mock = MockHdfsAccessor::new();
        mock.put_file("/test.zip", bytes.clone());
        mock.expect_stat(
            "/test.zip",
            Ok(Attrs {
                inode: 500,
                name: "test.zip".to_owned(),
                mode: libc::S_IFREG | 0o644,
                size: bytes.len() as u64,
                uid: 7,
                ..Default::default()
            }),
        );
        let (fs, _clock) = test_fs(&mock, "*", true);
        let root = fs.root();
        let Node::ZipDir(zip_root) = root.lookup(&fs, "test.zip@").unwrap() else {
            panic!("expected an archive root");
        };
        (fs, mock, zip_root)
    }

    fn expect_dir(node: Node) -> Arc<ZipDirNode> {
        match node {
            Node::ZipDir(dir) => dir,
            _ => panic!("expected an archive directory"),
        }
    }

    fn expect_file(node: Node) -> Arc<ZipFileNode> {
        match node {
            Node::ZipFile(file) => file,
            _ => panic!("expected an archive file"),
        }
    }

    #[test]
    fn archive_expands_into_the_expected_tree() {
        let (fs, _mock, zip_root) = mounted_archive();

        let mut names: Vec<String> = zip_root
            .read_dir(&fs)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, ["foo", "qux"]);

        let foo = expect_dir(zip_root.lookup(&fs, "foo").unwrap());
        let mut names: Vec<String> = foo
            .read_dir(&fs)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, ["a", "b", "bar", "baz"]);

        let a = expect_file(foo.lookup(&fs, "a").unwrap());
        assert_eq!(a.attrs().size, 1234);
        let b = expect_file(foo.lookup(&fs, "b").unwrap());
        assert_eq!(b.attrs().size, 4321);

        // Deep traversal through intermediate directories.
        let baz = expect_dir(foo.lookup(&fs, "baz").unwrap());
        let x = expect_dir(baz.lookup(&fs, "x").unwrap());
        let y = expect_dir(x.lookup(&fs, "y").unwrap());
        let z = expect_dir(y.lookup(&fs, "z").unwrap());
        let w = expect_file(z.lookup(&fs, "w").unwrap());
        assert_eq!(w.attrs().size, 256);

        let qux = expect_file(zip_root.lookup(&fs, "qux").unwrap());
        assert_eq!(qux.attrs().size, 1024);
        // Ownership is inherited from the archive root.
        assert_eq!(qux.attrs().uid, 7);

        assert!(matches!(
            zip_root.lookup(&fs, "nope"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn archive_entries_decompress_sequentially() {
        let (fs, _mock, zip_root) = mounted_archive();
        let qux = expect_file(zip_root.lookup(&fs, "qux").unwrap());

        let handle = qux.open().unwrap();
        let first = handle.read(0, 512).unwrap();
        let second = handle.read(512, 512).unwrap();
        let mut data = first.to_vec();
        data.extend_from_slice(&second);
        assert_eq!(data, entry_content(1024));

        // End of entry: an empty read, not an error.
        assert!(handle.read(1024, 64).unwrap().is_empty());
        handle.release().unwrap();

        fs.close_registered();
    }

    #[test]
    fn archive_parses_once_across_lookups() {
        let (fs, mock, zip_root) = mounted_archive();
        // First access parses the central directory.
        zip_root.read_dir(&fs).unwrap();
        let opens_after_parse = mock.open_read_count.load(std::sync::atomic::Ordering::Relaxed);
        assert!(opens_after_parse > 0);

        // Everything after that is in-memory.
        zip_root.lookup(&fs, "foo").unwrap();
        zip_root.lookup(&fs, "qux").unwrap();
        zip_root.read_dir(&fs).unwrap();
        assert_eq!(
            mock.open_read_count.load(std::sync::atomic::Ordering::Relaxed),
            opens_after_parse
        );
    }

    #[test]
    fn readdir_emits_virtual_directories_next_to_archives() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "*", true);
        let root = fs.root();
        mock.expect_read_dir(
            "/",
            Ok(vec![Attrs {
                inode: 600,
                name: "data.zip".to_owned(),
                mode: libc::S_IFREG | 0o644,
                size: 10,
                ..Default::default()
            }]),
        );
        let names: Vec<String> = root
            .read_dir(&fs)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["data.zip", "data.zip@"]);
    }

    #[test]
    fn no_virtual_entries_when_expansion_is_disabled() {
        let mock = MockHdfsAccessor::new();
        let (fs, _clock) = test_fs(&mock, "*", false);
        let root = fs.root();
        mock.expect_read_dir(
            "/",
            Ok(vec![Attrs {
                inode: 601,
                name: "data.zip".to_owned(),
                mode: libc::S_IFREG | 0o644,
                size: 10,
                ..Default::default()
            }]),
        );
        let names: Vec<String> = root
            .read_dir(&fs)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["data.zip"]);

        // Without expansion the @ name goes to the backend like any
        // other, and does not exist there.
        assert!(root.lookup(&fs, "data.zip@").is_err());
    }
}
