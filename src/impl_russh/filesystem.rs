use std::{io::SeekFrom, sync::atomic::Ordering};

use async_trait::async_trait;
use russh::Disconnect;
use russh_sftp::{
    client::{error::Error as SftpError, fs::Metadata},
    protocol::{OpenFlags, StatusCode},
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::{
    error::{ProtocolError, SessionError},
    filesystem::{
        join_remote, ByteRange, RemoteFileInfo, RemoteFilesystem, RemoteReader, RemoteWriter, S_IFDIR, S_IFLNK, S_IFMT,
    },
};

use super::RusshSession;

#[async_trait]
impl RemoteFilesystem for RusshSession {
    async fn stat(&self, path: &str) -> Result<RemoteFileInfo, SessionError> {
        let link = self
            .sftp_session
            .symlink_metadata(path)
            .await
            .map_err(|err| self.map_error(path, err))?;
        let is_link = mode_of(&link) & S_IFMT == S_IFLNK;
        if !is_link {
            return Ok(info(path, &link, false));
        }
        // a dangling link still reports as the link itself
        match self.sftp_session.metadata(path).await {
            Ok(target) => Ok(info(path, &target, true)),
            Err(SftpError::Status(_)) => Ok(info(path, &link, true)),
            Err(err) => Err(self.map_error(path, err)),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteFileInfo>, SessionError> {
        let dir = self
            .sftp_session
            .metadata(path)
            .await
            .map_err(|err| self.map_error(path, err))?;
        if mode_of(&dir) & S_IFMT != S_IFDIR {
            return Err(ProtocolError::NotADirectory(path.to_string()).into());
        }
        let entries = self
            .sftp_session
            .read_dir(path)
            .await
            .map_err(|err| self.map_error(path, err))?;
        Ok(entries
            .map(|entry| {
                let metadata = entry.metadata();
                info(&join_remote(path, &entry.file_name()), &metadata, false)
            })
            .collect())
    }

    async fn open(&self, path: &str, range: Option<ByteRange>) -> Result<RemoteReader, SessionError> {
        let mut file = self
            .sftp_session
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|err| self.map_error(path, err))?;
        let range = range.unwrap_or_default();
        if range.offset > 0 {
            file.seek(SeekFrom::Start(range.offset))
                .await
                .map_err(|err| self.transport(err.to_string()))?;
        }
        let reader: RemoteReader = match range.length {
            Some(length) => Box::new(file.take(length)),
            None => Box::new(file),
        };
        Ok(reader)
    }

    async fn create(&self, path: &str, force: bool) -> Result<RemoteWriter, SessionError> {
        if !force && self.exists(path).await? {
            return Err(ProtocolError::AlreadyExists(path.to_string()).into());
        }
        let file = self
            .sftp_session
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await
            .map_err(|err| self.map_error(path, err))?;
        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<RemoteFileInfo, SessionError> {
        if recursive {
            self.mkdir_all(path).await?;
        } else {
            if self.exists(path).await? {
                return Err(ProtocolError::AlreadyExists(path.to_string()).into());
            }
            self.sftp_session
                .create_dir(path)
                .await
                .map_err(|err| self.map_error(path, err))?;
        }
        self.stat(path).await
    }

    async fn remove(&self, path: &str) -> Result<(), SessionError> {
        let metadata = self
            .sftp_session
            .symlink_metadata(path)
            .await
            .map_err(|err| self.map_error(path, err))?;
        let result = if mode_of(&metadata) & S_IFMT == S_IFDIR {
            self.sftp_session.remove_dir(path).await
        } else {
            self.sftp_session.remove_file(path).await
        };
        result.map_err(|err| self.map_error(path, err))
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SessionError> {
        self.sftp_session
            .rename(old_path, new_path)
            .await
            .map_err(|err| self.map_error(old_path, err))
    }

    fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        // a locked handle is being closed or used; the flag above settles it next time
        self.handle_mutex
            .try_lock()
            .map_or(true, |handle| !handle.is_closed())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handle = self.handle_mutex.lock().await;
        if handle.is_closed() {
            return;
        }
        if let Err(err) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
            debug!(host = %self.host, error = %err, "disconnect failed");
        }
    }
}

impl RusshSession {
    async fn exists(&self, path: &str) -> Result<bool, SessionError> {
        self.sftp_session
            .try_exists(path)
            .await
            .map_err(|err| self.map_error(path, err))
    }

    /// Creates every missing component of `path`, like `mkdir -p`.
    async fn mkdir_all(&self, path: &str) -> Result<(), SessionError> {
        let mut current = if path.starts_with('/') { String::from("/") } else { String::new() };
        for component in path.split('/').filter(|part| !part.is_empty()) {
            current = if current.is_empty() {
                component.to_string()
            } else {
                join_remote(&current, component)
            };
            match self.sftp_session.metadata(current.as_str()).await {
                Ok(metadata) if mode_of(&metadata) & S_IFMT == S_IFDIR => continue,
                Ok(_) => return Err(ProtocolError::NotADirectory(current).into()),
                Err(SftpError::Status(status)) if matches!(status.status_code, StatusCode::NoSuchFile) => {}
                Err(err) => return Err(self.map_error(&current, err)),
            }
            self.sftp_session
                .create_dir(current.as_str())
                .await
                .map_err(|err| self.map_error(&current, err))?;
        }
        Ok(())
    }

    fn transport(&self, reason: String) -> SessionError {
        self.mark_dead();
        SessionError::Transport(reason)
    }

    fn map_error(&self, path: &str, err: SftpError) -> SessionError {
        match err {
            SftpError::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => ProtocolError::NotFound(path.to_string()).into(),
                StatusCode::PermissionDenied => ProtocolError::PermissionDenied(path.to_string()).into(),
                StatusCode::NoConnection | StatusCode::ConnectionLost => {
                    warn!(host = %self.host, path, message = %status.error_message, "server reported connection loss");
                    self.transport(status.error_message)
                }
                _ => ProtocolError::Failure {
                    path: path.to_string(),
                    message: status.error_message,
                }
                .into(),
            },
            other => self.transport(other.to_string()),
        }
    }
}

fn mode_of(metadata: &Metadata) -> u32 {
    metadata.permissions.unwrap_or(0)
}

fn info(path: &str, metadata: &Metadata, is_link: bool) -> RemoteFileInfo {
    RemoteFileInfo::from_attributes(
        path,
        mode_of(metadata),
        metadata.size.unwrap_or(0),
        metadata.mtime,
        is_link,
    )
}
