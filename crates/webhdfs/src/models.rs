//! Response models for the WebHDFS REST API.
//!
//! Field names mirror the JSON emitted by the name node, which in turn
//! mirrors the Hadoop protobuf definitions.

use serde::Deserialize;

/// The kind of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

/// One entry of file/directory metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    #[serde(default)]
    pub access_time: u64,
    #[serde(default)]
    pub block_size: u64,
    /// Stable 64-bit id of the inode on the name node.
    #[serde(default)]
    pub file_id: u64,
    pub group: String,
    /// File length in bytes; zero for directories.
    pub length: u64,
    /// Milliseconds since the epoch.
    pub modification_time: u64,
    pub owner: String,
    /// Entry name relative to the listed directory; empty for a
    /// GETFILESTATUS of the path itself.
    #[serde(default)]
    pub path_suffix: String,
    /// Octal permission string, e.g. `"755"`.
    pub permission: String,
    #[serde(default)]
    pub replication: u32,
    #[serde(rename = "type")]
    pub kind: FileType,
}

impl FileStatus {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    /// The permission string parsed as octal mode bits.
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        u16::from_str_radix(&self.permission, 8).unwrap_or(0)
    }
}

/// Space accounting for a subtree, from GETCONTENTSUMMARY.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSummary {
    pub directory_count: u64,
    pub file_count: u64,
    /// Total logical length of all files.
    pub length: u64,
    /// Namespace quota; `-1` when unset.
    pub quota: i64,
    /// Physical bytes consumed, including replication.
    pub space_consumed: u64,
    /// Space quota in bytes; `-1` when unset.
    pub space_quota: i64,
}

/// A Hadoop-side exception serialized into an error response.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteException {
    pub exception: String,
    #[serde(default, rename = "javaClassName")]
    pub java_class_name: Option<String>,
    #[serde(default)]
    pub message: String,
}

// Envelope structs: WebHDFS wraps every payload in a single-key object.

#[derive(Debug, Deserialize)]
pub(crate) struct FileStatusEnvelope {
    #[serde(rename = "FileStatus")]
    pub file_status: FileStatus,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileStatusesEnvelope {
    #[serde(rename = "FileStatuses")]
    pub file_statuses: FileStatuses,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileStatuses {
    #[serde(rename = "FileStatus")]
    pub file_status: Vec<FileStatus>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BooleanEnvelope {
    pub boolean: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContentSummaryEnvelope {
    #[serde(rename = "ContentSummary")]
    pub content_summary: ContentSummary,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RemoteExceptionEnvelope {
    #[serde(rename = "RemoteException")]
    pub remote_exception: RemoteException,
}
