use std::{
    fmt,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{ConfigError, GatewayError, ProtocolError, SessionError},
    filesystem::{join_remote, normalize_remote, ByteRange, RemoteFileInfo, RemoteFilesystem},
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Counters for one logical transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub files: u64,
    pub directories: u64,
    /// Height of the transferred tree: 0 for a lone file, 1 for a directory of files.
    pub depth: u32,
    pub bytes: u64,
    pub runtime: Duration,
}

impl TransferStats {
    /// Folds a child's counters into this one.
    pub fn merge(&mut self, child: &TransferStats) {
        self.files += child.files;
        self.directories += child.directories;
        self.bytes += child.bytes;
        self.runtime += child.runtime;
        self.depth = self.depth.max(child.depth + 1);
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files, {} directories, {} bytes",
            self.files, self.directories, self.bytes
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub force: bool,
    pub range: Option<ByteRange>,
    pub chunk_size: usize,
    pub max_depth: usize,
}

enum PumpError {
    Read(io::Error),
    Write(io::Error),
    Cancelled,
}

/// Drives get and put over one session, descending into directories depth first.
pub struct TransferEngine<'a, F: RemoteFilesystem + ?Sized> {
    fs: &'a F,
    options: TransferOptions,
    cancel: &'a CancellationToken,
}

impl<'a, F: RemoteFilesystem + ?Sized> TransferEngine<'a, F> {
    pub fn new(fs: &'a F, options: TransferOptions, cancel: &'a CancellationToken) -> TransferEngine<'a, F> {
        TransferEngine { fs, options, cancel }
    }

    /// Copies `remote` (already stat'ed) to `local`. On a directory failure the
    /// error is a `PartialTransfer` holding the counters reached so far.
    pub async fn download(&self, remote: &RemoteFileInfo, local: &Path) -> Result<TransferStats, GatewayError> {
        let started = Instant::now();
        let mut stats = TransferStats::default();

        let result = if remote.is_dir {
            self.reject_range()?;
            self.download_dir(&remote.path, remote.mode, local, 1, &mut stats).await
        } else {
            self.download_file(&remote.path, remote.mode, local, &mut stats).await
        };
        stats.runtime = started.elapsed();

        match result {
            Ok(()) => {
                info!(remote = %remote.path, local = %local.display(), %stats, "download complete");
                Ok(stats)
            }
            Err(err) => Err(with_totals(err, stats)),
        }
    }

    /// Copies `local` to `remote`, mirroring [`TransferEngine::download`].
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<TransferStats, GatewayError> {
        let started = Instant::now();
        let mut stats = TransferStats::default();

        let metadata = fs::metadata(local)
            .await
            .map_err(|err| GatewayError::local("stat", local, err))?;
        let result = if metadata.is_dir() {
            self.reject_range()?;
            self.upload_dir(local, remote, 1, &mut stats).await
        } else {
            self.upload_file(local, remote, &mut stats).await
        };
        stats.runtime = started.elapsed();

        match result {
            Ok(()) => {
                info!(local = %local.display(), remote = %remote, %stats, "upload complete");
                Ok(stats)
            }
            Err(err) => Err(with_totals(err, stats)),
        }
    }

    fn download_dir<'b>(
        &'b self,
        remote: &'b str,
        mode: u32,
        local: &'b Path,
        level: usize,
        stats: &'b mut TransferStats,
    ) -> BoxFuture<'b, Result<(), GatewayError>> {
        Box::pin(async move {
            self.enter(remote, level)?;
            ensure_local_dir(local, mode).await?;
            stats.directories += 1;

            let entries = self
                .fs
                .read_dir(remote)
                .await
                .map_err(|err| GatewayError::session("read_dir", remote, err))?;

            for entry in entries {
                if is_self_reference(remote, &entry) {
                    continue;
                }
                let remote_child = join_remote(remote, &entry.name);
                let local_child = local.join(&entry.name);
                let mut child = TransferStats::default();
                let result = match self.resolve_link(&remote_child, entry).await {
                    Ok(entry) if entry.is_dir => {
                        self.download_dir(&remote_child, entry.mode, &local_child, level + 1, &mut child)
                            .await
                    }
                    Ok(entry) => {
                        self.download_file(&remote_child, entry.mode, &local_child, &mut child)
                            .await
                    }
                    Err(err) => Err(err),
                };
                stats.merge(&child);
                result.map_err(|err| aborted_in(remote, err))?;
            }
            Ok(())
        })
    }

    async fn download_file(
        &self,
        remote: &str,
        mode: u32,
        local: &Path,
        stats: &mut TransferStats,
    ) -> Result<(), GatewayError> {
        self.checkpoint()?;
        debug!(remote = %remote, local = %local.display(), "downloading file");

        let range = self.options.range.filter(|range| !range.is_whole_file());
        let mut reader = self
            .fs
            .open(remote, range)
            .await
            .map_err(|err| GatewayError::session("open", remote, err))?;
        let mut file = self.create_local(local).await?;

        self.pump(&mut reader, &mut file, &mut stats.bytes)
            .await
            .map_err(|err| match err {
                PumpError::Read(err) => self.stream_error("read", remote, err),
                PumpError::Write(err) => GatewayError::local("write", local, err),
                PumpError::Cancelled => GatewayError::Cancelled,
            })?;
        set_local_mode(local, mode).await?;

        stats.files += 1;
        Ok(())
    }

    fn upload_dir<'b>(
        &'b self,
        local: &'b Path,
        remote: &'b str,
        level: usize,
        stats: &'b mut TransferStats,
    ) -> BoxFuture<'b, Result<(), GatewayError>> {
        Box::pin(async move {
            self.enter(remote, level)?;
            match self.fs.stat(remote).await {
                Ok(info) if info.is_dir => {}
                Ok(_) => {
                    return Err(GatewayError::Protocol {
                        op: "mkdir",
                        source: ProtocolError::NotADirectory(remote.to_string()),
                    })
                }
                Err(SessionError::Protocol(ProtocolError::NotFound(_))) => {
                    self.fs
                        .mkdir(remote, false)
                        .await
                        .map_err(|err| GatewayError::session("mkdir", remote, err))?;
                }
                Err(err) => return Err(GatewayError::session("stat", remote, err)),
            }
            stats.directories += 1;

            let mut entries = fs::read_dir(local)
                .await
                .map_err(|err| GatewayError::local("read_dir", local, err))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| GatewayError::local("read_dir", local, err))?
            {
                let local_child = entry.path();
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    return Err(aborted_in(
                        remote,
                        GatewayError::local(
                            "read_dir",
                            &local_child,
                            io::Error::new(io::ErrorKind::InvalidData, "file name is not valid UTF-8"),
                        ),
                    ));
                };
                let remote_child = join_remote(remote, &name);
                let mut child = TransferStats::default();
                let result = match fs::metadata(&local_child).await {
                    Ok(metadata) if metadata.is_dir() => {
                        self.upload_dir(&local_child, &remote_child, level + 1, &mut child)
                            .await
                    }
                    Ok(metadata) if metadata.is_file() => {
                        self.upload_file(&local_child, &remote_child, &mut child).await
                    }
                    Ok(_) => {
                        debug!(path = %local_child.display(), "skipping special file");
                        Ok(())
                    }
                    Err(err) => Err(GatewayError::local("stat", &local_child, err)),
                };
                stats.merge(&child);
                result.map_err(|err| aborted_in(remote, err))?;
            }
            Ok(())
        })
    }

    async fn upload_file(&self, local: &Path, remote: &str, stats: &mut TransferStats) -> Result<(), GatewayError> {
        self.checkpoint()?;
        debug!(local = %local.display(), remote = %remote, "uploading file");

        let mut file = fs::File::open(local)
            .await
            .map_err(|err| GatewayError::local("open", local, err))?;
        let mut writer = self
            .fs
            .create(remote, self.options.force)
            .await
            .map_err(|err| GatewayError::session("create", remote, err))?;

        self.pump(&mut file, &mut writer, &mut stats.bytes)
            .await
            .map_err(|err| match err {
                PumpError::Read(err) => GatewayError::local("read", local, err),
                PumpError::Write(err) => self.stream_error("write", remote, err),
                PumpError::Cancelled => GatewayError::Cancelled,
            })?;
        writer
            .shutdown()
            .await
            .map_err(|err| self.stream_error("write", remote, err))?;

        stats.files += 1;
        Ok(())
    }

    /// Copies until EOF, checking for cancellation around every chunk.
    async fn pump<R, W>(&self, reader: &mut R, writer: &mut W, bytes: &mut u64) -> Result<(), PumpError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.options.chunk_size];
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PumpError::Cancelled),
                read = reader.read(&mut buf) => read.map_err(PumpError::Read)?,
            };
            if read == 0 {
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PumpError::Cancelled),
                written = writer.write_all(&buf[..read]) => written.map_err(PumpError::Write)?,
            }
            *bytes += read as u64;
        }
        writer.flush().await.map_err(PumpError::Write)
    }

    /// Opens the local destination. Without `force` an existing file is never touched.
    async fn create_local(&self, local: &Path) -> Result<fs::File, GatewayError> {
        let mut options = OpenOptions::new();
        options.write(true);
        if self.options.force {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        options.open(local).await.map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                GatewayError::local(
                    "create",
                    local,
                    io::Error::new(io::ErrorKind::AlreadyExists, "file exists and force is not set"),
                )
            } else {
                GatewayError::local("create", local, err)
            }
        })
    }

    /// A failed remote read or write only means the connection is gone when the
    /// session says so. Otherwise the server refused that one file.
    fn stream_error(&self, op: &'static str, remote: &str, err: io::Error) -> GatewayError {
        if self.fs.is_alive() {
            GatewayError::Protocol {
                op,
                source: ProtocolError::Failure {
                    path: remote.to_string(),
                    message: err.to_string(),
                },
            }
        } else {
            GatewayError::Transport {
                path: remote.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// Follows a listed symlink so that links to directories are walked as directories.
    async fn resolve_link(&self, path: &str, entry: RemoteFileInfo) -> Result<RemoteFileInfo, GatewayError> {
        if !entry.is_link || entry.is_dir {
            return Ok(entry);
        }
        self.fs
            .stat(path)
            .await
            .map_err(|err| GatewayError::session("stat", path, err))
    }

    fn enter(&self, path: &str, level: usize) -> Result<(), GatewayError> {
        self.checkpoint()?;
        if level > self.options.max_depth {
            return Err(GatewayError::DepthLimit {
                path: path.to_string(),
                max: self.options.max_depth,
            });
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), GatewayError> {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        Ok(())
    }

    fn reject_range(&self) -> Result<(), GatewayError> {
        match self.options.range {
            Some(range) if !range.is_whole_file() => Err(ConfigError::Invalid {
                field: "range",
                reason: "byte ranges apply to single files, not directories".to_string(),
            }
            .into()),
            _ => Ok(()),
        }
    }
}

/// `.`, `..` and anything pointing back at the listed directory would never terminate.
pub(crate) fn is_self_reference(dir: &str, entry: &RemoteFileInfo) -> bool {
    entry.name == "."
        || entry.name == ".."
        || entry.name.is_empty()
        || normalize_remote(&entry.path) == normalize_remote(dir)
}

/// Tags a child failure with the directory it aborted. Only the innermost directory is kept.
fn aborted_in(dir: &str, err: GatewayError) -> GatewayError {
    match err {
        err @ GatewayError::PartialTransfer { .. } => err,
        source => GatewayError::PartialTransfer {
            dir: dir.to_string(),
            stats: TransferStats::default(),
            source: Box::new(source),
        },
    }
}

fn with_totals(err: GatewayError, totals: TransferStats) -> GatewayError {
    match err {
        GatewayError::PartialTransfer { dir, source, .. } => GatewayError::PartialTransfer {
            dir,
            stats: totals,
            source,
        },
        other => other,
    }
}

async fn ensure_local_dir(path: &Path, mode: u32) -> Result<(), GatewayError> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(GatewayError::local(
            "create directory",
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "path exists and is not a directory"),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            dir_builder(mode)
                .create(path)
                .await
                .map_err(|err| GatewayError::local("create directory", path, err))
        }
        Err(err) => Err(GatewayError::local("stat", path, err)),
    }
}

#[cfg(unix)]
fn dir_builder(mode: u32) -> fs::DirBuilder {
    let mut builder = fs::DirBuilder::new();
    if mode & 0o777 != 0 {
        builder.mode(mode & 0o7777);
    }
    builder
}

#[cfg(not(unix))]
fn dir_builder(_mode: u32) -> fs::DirBuilder {
    fs::DirBuilder::new()
}

#[cfg(unix)]
async fn set_local_mode(path: &Path, mode: u32) -> Result<(), GatewayError> {
    use std::os::unix::fs::PermissionsExt;

    if mode & 0o777 == 0 {
        return Ok(());
    }
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
        .await
        .map_err(|err| GatewayError::local("chmod", path, err))
}

#[cfg(not(unix))]
async fn set_local_mode(_path: &Path, _mode: u32) -> Result<(), GatewayError> {
    Ok(())
}

/// Resolves where a download of `remote` lands when `local` is an existing directory.
pub fn download_target(remote: &RemoteFileInfo, local: &Path, local_is_dir: bool) -> PathBuf {
    if local_is_dir && !remote.is_dir {
        local.join(&remote.name)
    } else {
        local.to_path_buf()
    }
}
