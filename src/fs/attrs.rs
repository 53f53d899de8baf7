//! Cached node attributes.

use std::time::{Duration, SystemTime};

/// Attributes common to file and directory nodes, as translated from the
/// name node's file-status records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attrs {
    /// Stable inode id. Remote nodes carry the name node's file id;
    /// synthesized nodes (archive entries) get a high-range local id.
    pub inode: u64,
    /// Entry name within the parent directory.
    pub name: String,
    /// Permission bits plus the `S_IFDIR`/`S_IFREG` type bit.
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    /// When the cached attributes stop being authoritative and a re-stat
    /// is required.
    pub expires: SystemTime,
}

impl Default for Attrs {
    fn default() -> Self {
        Self {
            inode: 0,
            name: String::new(),
            mode: 0,
            size: 0,
            uid: 0,
            gid: 0,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            // The epoch is long past: default attrs are born expired.
            expires: SystemTime::UNIX_EPOCH,
        }
    }
}

impl Attrs {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFDIR != 0
    }

    #[must_use]
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    #[must_use]
    pub fn expired(&self, now: SystemTime) -> bool {
        now > self.expires
    }

    /// Mark these attributes stale so the next kernel query re-stats.
    pub fn invalidate(&mut self, now: SystemTime) {
        self.expires = now - Duration::from_secs(1);
    }

    /// Render for the kernel.
    #[must_use]
    pub fn to_fuse(&self) -> fuser::FileAttr {
        let (kind, size) = if self.is_dir() {
            (fuser::FileType::Directory, 0)
        } else {
            (fuser::FileType::RegularFile, self.size)
        };
        fuser::FileAttr {
            ino: self.inode,
            size,
            blocks: size.div_ceil(512),
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind,
            perm: self.perm(),
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

/// Usage of the remote store, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsInfo {
    pub capacity: u64,
    pub used: u64,
    pub remaining: u64,
}
