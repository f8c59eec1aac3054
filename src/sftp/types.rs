//! SFTP types

use serde::{Deserialize, Serialize};

/// File-type mask of a POSIX mode value
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// Directory entry as reported by the file channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    /// Raw mode (type + permission bits), if the server sent attributes
    pub mode: Option<u32>,
    /// Modification time, Unix seconds
    pub mtime: Option<u64>,
}

/// Directory entry returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    /// Unix seconds, 0 when unknown
    pub modified_time: u64,
    pub is_directory: bool,
    pub is_file: bool,
}

impl From<RemoteEntry> for FileEntry {
    /// Classification looks only at the file-type bits, so a symlink,
    /// socket or device is neither a directory nor a file.
    fn from(entry: RemoteEntry) -> Self {
        let mode = entry.mode.unwrap_or(0);
        let kind = mode & S_IFMT;
        Self {
            name: entry.name,
            size: entry.size,
            mode,
            modified_time: entry.mtime.unwrap_or(0),
            is_directory: kind == S_IFDIR,
            is_file: kind == S_IFREG,
        }
    }
}
