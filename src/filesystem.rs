use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SessionError;

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) const S_IFMT: u32 = 0o170000;
pub(crate) const S_IFDIR: u32 = 0o040000;
pub(crate) const S_IFLNK: u32 = 0o120000;

/// Snapshot of a remote file's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFileInfo {
    pub name: String,
    pub path: String,
    /// `ls -l` style, e.g. `drwxr-xr-x`.
    pub permissions: String,
    pub mode: u32,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub is_link: bool,
}

impl RemoteFileInfo {
    /// Builds the snapshot from raw SFTP attributes. `is_link` is passed separately
    /// because a stat that followed the link no longer carries that bit.
    pub fn from_attributes(path: &str, mode: u32, size: u64, mtime: Option<u32>, is_link: bool) -> RemoteFileInfo {
        RemoteFileInfo {
            name: file_name(path).to_string(),
            path: path.to_string(),
            permissions: permission_string(mode),
            mode,
            size,
            modified: mtime.and_then(|secs| DateTime::from_timestamp(i64::from(secs), 0)),
            is_dir: mode & S_IFMT == S_IFDIR,
            is_link: is_link || mode & S_IFMT == S_IFLNK,
        }
    }
}

/// A window into a remote file. Without a length it runs to end of file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn is_whole_file(&self) -> bool {
        self.offset == 0 && self.length.is_none()
    }
}

/// The SFTP primitives the gateway is built from, one protocol action each.
#[async_trait]
pub trait RemoteFilesystem: Send + Sync {
    async fn stat(&self, path: &str) -> Result<RemoteFileInfo, SessionError>;

    /// Entries in server order, `.` and `..` included if the server sends them.
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteFileInfo>, SessionError>;

    async fn open(&self, path: &str, range: Option<ByteRange>) -> Result<RemoteReader, SessionError>;

    /// Fails with `AlreadyExists` when the path exists and `force` is false.
    async fn create(&self, path: &str, force: bool) -> Result<RemoteWriter, SessionError>;

    /// Fails with `AlreadyExists` when the path exists and `recursive` is false.
    async fn mkdir(&self, path: &str, recursive: bool) -> Result<RemoteFileInfo, SessionError>;

    async fn remove(&self, path: &str) -> Result<(), SessionError>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SessionError>;

    fn is_alive(&self) -> bool;

    async fn close(&self);
}

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Normalizes a remote path for comparison: no trailing slash, no `.` components,
/// no repeated separators.
pub fn normalize_remote(path: &str) -> String {
    let absolute = path.starts_with('/');
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty() && *part != ".").collect();
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

pub fn permission_string(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        0o010000 => 'p',
        0o020000 => 'c',
        0o060000 => 'b',
        0o140000 => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_strings() {
        assert_eq!(permission_string(0o040755), "drwxr-xr-x");
        assert_eq!(permission_string(0o100644), "-rw-r--r--");
        assert_eq!(permission_string(0o120777), "lrwxrwxrwx");
        assert_eq!(permission_string(0o100000), "----------");
    }

    #[test]
    fn joins_and_names() {
        assert_eq!(join_remote("/srv", "a.txt"), "/srv/a.txt");
        assert_eq!(join_remote("/", "srv"), "/srv");
        assert_eq!(file_name("/srv/data/"), "data");
        assert_eq!(file_name("/"), "/");
        assert_eq!(file_name("relative"), "relative");
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_remote("/srv//data/./"), "/srv/data");
        assert_eq!(normalize_remote("/"), "/");
        assert_eq!(normalize_remote("./"), ".");
        assert_eq!(normalize_remote("data/"), "data");
    }

    #[test]
    fn attributes_snapshot() {
        let info = RemoteFileInfo::from_attributes("/srv/data", 0o040750, 4096, Some(0), false);
        assert!(info.is_dir);
        assert!(!info.is_link);
        assert_eq!(info.name, "data");
        assert_eq!(info.permissions, "drwxr-x---");
        assert_eq!(info.modified.map(|m| m.timestamp()), Some(0));
    }
}
