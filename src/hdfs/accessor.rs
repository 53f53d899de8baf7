//! The base accessor: one set of name nodes, one cached metadata client.
//!
//! All metadata operations run under a single mutex, which also guards
//! the lazily-connected client and the uid cache. Streaming reads open
//! their own connection and never touch that mutex, so any number of
//! reads proceed concurrently with metadata traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use webhdfs::{Client, FileStatus, WebHdfsError};

use hdfsfs::clock::Clock;
use hdfsfs::error::{FsError, FsResult};
use hdfsfs::io::ReadSeekCloser;

use crate::fs::attrs::{Attrs, FsInfo};
use crate::hdfs::{HdfsAccessor, HdfsWriter};

/// How long a resolved uid stays fresh.
const UID_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Uid reported for owners the host user database does not know.
const UNKNOWN_UID: u32 = (1 << 31) - 1;

/// Accessor over the WebHDFS wire client.
pub struct WebHdfsAccessor {
    addresses: Vec<String>,
    user: String,
    clock: Arc<dyn Clock>,
    state: Mutex<MetaState>,
}

struct MetaState {
    /// Lazily (re)connected metadata client. Reset on malignant errors so
    /// the next operation connects afresh, possibly to another name node.
    client: Option<Client>,
    /// Index into `addresses` of the name node to try next.
    current_idx: usize,
    uid_cache: HashMap<String, UidCacheEntry>,
}

struct UidCacheEntry {
    uid: u32,
    expires: SystemTime,
}

impl WebHdfsAccessor {
    /// `addresses` is the comma-separated name node list from the CLI.
    #[must_use]
    pub fn new(addresses: &str, user: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            addresses: addresses.split(',').map(str::to_owned).collect(),
            user: user.to_owned(),
            clock,
            state: Mutex::new(MetaState {
                client: None,
                current_idx: 0,
                uid_cache: HashMap::new(),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MetaState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Connect to the current name node; on failure advance the index so
    /// the next attempt tries the next one. Runs under the metadata lock.
    fn connect(&self, state: &mut MetaState) -> FsResult<Client> {
        let addr = &self.addresses[state.current_idx];
        match self.health_checked_client(addr) {
            Ok(client) => {
                info!(addr = %addr, "connected to name node");
                Ok(client)
            }
            Err(e) => {
                state.current_idx = (state.current_idx + 1) % self.addresses.len();
                Err(FsError::Transport(format!("{addr}: {e}")))
            }
        }
    }

    /// Same round-robin dance for read connections, holding the state
    /// lock only around the index bookkeeping so streaming reads never
    /// contend with metadata traffic.
    fn connect_for_read(&self) -> FsResult<Client> {
        let idx = self.lock_state().current_idx;
        let addr = &self.addresses[idx];
        match self.health_checked_client(addr) {
            Ok(client) => Ok(client),
            Err(e) => {
                let mut state = self.lock_state();
                if state.current_idx == idx {
                    state.current_idx = (idx + 1) % self.addresses.len();
                }
                Err(FsError::Transport(format!("{addr}: {e}")))
            }
        }
    }

    /// Build a client and probe the name node with a stat of a path that
    /// normally does not exist. OK and *not-found* both mean the name
    /// node is up and active; anything else is a connect failure.
    fn health_checked_client(&self, addr: &str) -> Result<Client, WebHdfsError> {
        let client = Client::new(addr, &self.user);
        match client.get_file_status("/$") {
            Ok(_) => Ok(client),
            Err(e) if e.is_not_found() => Ok(client),
            Err(e) => Err(e),
        }
    }

    fn metadata_client(&self, state: &mut MetaState) -> FsResult<Client> {
        if let Some(client) = &state.client {
            return Ok(client.clone());
        }
        let client = self.connect(state)?;
        state.client = Some(client.clone());
        Ok(client)
    }

    /// Run one metadata call. On a malignant error the cached client is
    /// dropped so the next call reconnects.
    fn with_metadata_client<T>(
        &self,
        path: &str,
        f: impl FnOnce(&Client, &mut MetaState) -> Result<T, WebHdfsError>,
    ) -> FsResult<T> {
        let mut state = self.lock_state();
        let client = self.metadata_client(&mut state)?;
        match f(&client, &mut state) {
            Ok(v) => Ok(v),
            Err(e) => {
                let err = wire_error(e, path);
                if !err.is_benign() {
                    state.client = None;
                }
                Err(err)
            }
        }
    }

    fn attrs_from_status(&self, state: &mut MetaState, status: &FileStatus, name: String) -> Attrs {
        let mode = u32::from(status.permission_bits())
            | if status.is_dir() {
                libc::S_IFDIR
            } else {
                libc::S_IFREG
            };
        let mtime = UNIX_EPOCH + Duration::from_secs(status.modification_time / 1000);
        Attrs {
            inode: status.file_id,
            name,
            mode,
            size: status.length,
            uid: self.lookup_uid(state, &status.owner),
            // TODO(groups): map the owning group instead of hardcoding root.
            gid: 0,
            mtime,
            ctime: mtime,
            crtime: mtime,
            expires: UNIX_EPOCH,
        }
    }

    /// Cache-assisted username → uid resolution against the host user
    /// database. Runs under the metadata mutex.
    fn lookup_uid(&self, state: &mut MetaState, user_name: &str) -> u32 {
        if user_name.is_empty() {
            return 0;
        }
        let now = self.clock.now();
        if let Some(entry) = state.uid_cache.get(user_name) {
            if now < entry.expires {
                return entry.uid;
            }
        }
        let uid = match nix::unistd::User::from_name(user_name) {
            Ok(Some(user)) => user.uid.as_raw(),
            Ok(None) => UNKNOWN_UID,
            Err(e) => {
                warn!(user_name, error = %e, "user database lookup failed");
                UNKNOWN_UID
            }
        };
        state.uid_cache.insert(
            user_name.to_owned(),
            UidCacheEntry {
                uid,
                expires: now + UID_CACHE_TTL,
            },
        );
        uid
    }
}

/// Translate a wire error for `path` into the shared error type.
fn wire_error(e: WebHdfsError, path: &str) -> FsError {
    if e.is_not_found() {
        FsError::NotFound(path.to_owned())
    } else if e.is_already_exists() {
        FsError::AlreadyExists(path.to_owned())
    } else {
        FsError::Transport(e.to_string())
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_owned()
}

impl HdfsAccessor for WebHdfsAccessor {
    fn ensure_connected(&self) -> FsResult<()> {
        let mut state = self.lock_state();
        self.metadata_client(&mut state).map(|_| ())
    }

    fn open_read(&self, path: &str) -> FsResult<Box<dyn ReadSeekCloser>> {
        // Reads get their own connection so concurrent streams are not
        // bounded by the metadata mutex.
        let client = self.connect_for_read()?;
        let reader = client.open(path, 0).map_err(|e| wire_error(e, path))?;
        Ok(Box::new(WebHdfsStream {
            path: path.to_owned(),
            reader,
        }))
    }

    fn create_file(&self, path: &str, mode: u32) -> FsResult<Box<dyn HdfsWriter>> {
        let writer = self.with_metadata_client(path, |client, _| {
            client.create(path, (mode & 0o7777) as u16)
        })?;
        Ok(Box::new(WebHdfsWriteStream {
            path: path.to_owned(),
            writer,
        }))
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<Attrs>> {
        self.with_metadata_client(path, |client, state| {
            let listing = client.list_status(path)?;
            Ok(listing
                .iter()
                .map(|status| {
                    let name = status.path_suffix.clone();
                    self.attrs_from_status(state, status, name)
                })
                .collect())
        })
    }

    fn stat(&self, path: &str) -> FsResult<Attrs> {
        self.with_metadata_client(path, |client, state| {
            let status = client.get_file_status(path)?;
            Ok(self.attrs_from_status(state, &status, base_name(path)))
        })
    }

    fn stat_fs(&self) -> FsResult<FsInfo> {
        self.with_metadata_client("/", |client, _| {
            let summary = client.content_summary("/")?;
            let capacity = if summary.space_quota < 0 {
                u64::MAX
            } else {
                summary.space_quota as u64
            };
            let used = summary.space_consumed;
            Ok(FsInfo {
                capacity,
                used,
                remaining: capacity.saturating_sub(used),
            })
        })
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        self.with_metadata_client(path, |client, _| {
            client.mkdirs(path, (mode & 0o7777) as u16)
        })
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        // Never touch anything already in the trash.
        if path.contains(".Trash") {
            warn!(path, "refusing to remove a path inside .Trash");
            return Ok(());
        }
        // Simulate a trash-enabled `rm`: the file is renamed, not deleted.
        let trash_path = format!("/user/root/.Trash{path}");
        self.rename(path, &trash_path)
    }

    fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        self.with_metadata_client(old_path, |client, _| client.rename(old_path, new_path))
    }

    fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        self.with_metadata_client(path, |client, _| {
            client.set_permission(path, (mode & 0o7777) as u16)
        })
    }

    fn chown(&self, path: &str, user: &str, group: &str) -> FsResult<()> {
        self.with_metadata_client(path, |client, _| {
            let owner = (!user.is_empty()).then_some(user);
            let group = (!group.is_empty()).then_some(group);
            client.set_owner(path, owner, group)
        })
    }

    fn close_client(&self) -> FsResult<()> {
        self.lock_state().client = None;
        Ok(())
    }
}

/// Positional stream over one WebHDFS read connection.
struct WebHdfsStream {
    path: String,
    reader: webhdfs::FileReader,
}

impl ReadSeekCloser for WebHdfsStream {
    fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        self.reader
            .read(buf)
            .map_err(|e| wire_error(e, &self.path))
    }

    fn seek(&mut self, pos: u64) -> FsResult<()> {
        self.reader.seek(pos);
        Ok(())
    }

    fn position(&mut self) -> FsResult<u64> {
        Ok(self.reader.position())
    }

    fn close(&mut self) -> FsResult<()> {
        self.reader.close();
        Ok(())
    }
}

struct WebHdfsWriteStream {
    path: String,
    writer: webhdfs::FileWriter,
}

impl HdfsWriter for WebHdfsWriteStream {
    fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        self.writer
            .write(buf)
            .map_err(|e| wire_error(e, &self.path))
    }

    fn close(&mut self) -> FsResult<()> {
        self.writer
            .close()
            .map_err(|e| wire_error(e, &self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trash_paths_are_left_alone() {
        // `remove` must not recurse into renaming trash contents; the
        // wire-free part of the logic is testable without a cluster.
        assert!("/user/root/.Trash/foo".contains(".Trash"));
        let path = "/data/reports/q3";
        assert_eq!(
            format!("/user/root/.Trash{path}"),
            "/user/root/.Trash/data/reports/q3"
        );
    }

    #[test]
    fn base_name_of_paths() {
        assert_eq!(base_name("/foo/bar"), "bar");
        assert_eq!(base_name("/foo"), "foo");
        assert_eq!(base_name("/"), "");
    }
}
