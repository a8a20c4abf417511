#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::Cursor,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use sftp_gateway::{
    config::HostKeyPolicyKind,
    descriptor::SshTarget,
    error::{GatewayError, ProtocolError, SessionError},
    filesystem::{
        file_name, join_remote, normalize_remote, ByteRange, RemoteFileInfo, RemoteFilesystem, RemoteReader,
        RemoteWriter,
    },
    Connector, Gateway, GatewayConfig, RemoteSystem,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

pub fn system() -> RemoteSystem {
    RemoteSystem::with_password("files.local", 22, "deploy", "secret")
}

pub fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.host_keys.policy = HostKeyPolicyKind::AcceptAny;
    config.chunk_size = 256;
    config
}

pub fn gateway(store: &Arc<Store>) -> Gateway<MemoryConnector> {
    Gateway::new(MemoryConnector::new(store.clone()), config())
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// The remote tree shared by every session a [`MemoryConnector`] dials, plus
/// the faults tests inject into it.
#[derive(Default)]
pub struct Store {
    nodes: Mutex<BTreeMap<String, Node>>,
    fail_open: Mutex<HashSet<String>>,
    drop_on: Mutex<HashSet<String>>,
    fail_read: Mutex<HashSet<String>>,
    fail_write: Mutex<HashSet<String>>,
    cancel_on_open: Mutex<Vec<(String, CancellationToken)>>,
    self_listing: AtomicBool,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
}

impl Store {
    pub fn new() -> Arc<Store> {
        let store = Store::default();
        store.nodes.lock().unwrap().insert("/".into(), Node::Dir);
        Arc::new(store)
    }

    pub fn add_dir(&self, path: &str) {
        self.nodes.lock().unwrap().insert(normalize_remote(path), Node::Dir);
    }

    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(normalize_remote(path), Node::File(data.into()));
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(&normalize_remote(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.lock().unwrap().get(&normalize_remote(path)), Some(Node::Dir))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(&normalize_remote(path))
    }

    /// Opening `path` fails with a protocol error from now on.
    pub fn fail_open(&self, path: &str) {
        self.fail_open.lock().unwrap().insert(normalize_remote(path));
    }

    /// Touching `path` kills the session that touched it.
    pub fn drop_on(&self, path: &str) {
        self.drop_on.lock().unwrap().insert(normalize_remote(path));
    }

    /// Reads of `path` fail while the session stays up.
    pub fn fail_read(&self, path: &str) {
        self.fail_read.lock().unwrap().insert(normalize_remote(path));
    }

    /// Writes to `path` fail while the session stays up.
    pub fn fail_write(&self, path: &str) {
        self.fail_write.lock().unwrap().insert(normalize_remote(path));
    }

    /// Opening `path` for reading cancels `token`, as a client hanging up mid-transfer would.
    pub fn cancel_on_open(&self, path: &str, token: CancellationToken) {
        self.cancel_on_open.lock().unwrap().push((normalize_remote(path), token));
    }

    pub fn clear_faults(&self) {
        self.fail_open.lock().unwrap().clear();
        self.drop_on.lock().unwrap().clear();
        self.fail_read.lock().unwrap().clear();
        self.fail_write.lock().unwrap().clear();
        self.cancel_on_open.lock().unwrap().clear();
    }

    /// Listings also return `.`, `..` and an entry naming the directory itself.
    pub fn list_self_references(&self) {
        self.self_listing.store(true, Ordering::SeqCst);
    }

    /// Marks every session dialed so far as disconnected.
    pub fn disconnect_all(&self) {
        for alive in self.sessions.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    fn info(&self, path: &str) -> Option<RemoteFileInfo> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(path).map(|node| info_of(path, node))
    }

    fn children(&self, dir: &str) -> Vec<RemoteFileInfo> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .filter(|(path, _)| path.as_str() != dir && parent_of(path) == dir)
            .map(|(path, node)| info_of(path, node))
            .collect()
    }
}

fn info_of(path: &str, node: &Node) -> RemoteFileInfo {
    match node {
        Node::Dir => RemoteFileInfo::from_attributes(path, 0o040755, 4096, Some(1_700_000_000), false),
        Node::File(data) => {
            RemoteFileInfo::from_attributes(path, 0o100644, data.len() as u64, Some(1_700_000_000), false)
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(index) => path[..index].to_string(),
        None => ".".to_string(),
    }
}

/// One dialed session over a [`Store`].
pub struct MemoryFs {
    store: Arc<Store>,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryFs {
    pub fn new(store: Arc<Store>) -> MemoryFs {
        let alive = Arc::new(AtomicBool::new(true));
        store.sessions.lock().unwrap().push(alive.clone());
        MemoryFs {
            store,
            alive,
            closed: AtomicBool::new(false),
        }
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self, path: &str) -> Result<String, SessionError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("connection lost".into()));
        }
        let path = normalize_remote(path);
        if self.store.drop_on.lock().unwrap().contains(&path) {
            self.alive.store(false, Ordering::SeqCst);
            return Err(SessionError::Transport("connection reset by peer".into()));
        }
        Ok(path)
    }
}

#[async_trait]
impl RemoteFilesystem for MemoryFs {
    async fn stat(&self, path: &str) -> Result<RemoteFileInfo, SessionError> {
        let path = self.check(path)?;
        self.store
            .info(&path)
            .ok_or_else(|| ProtocolError::NotFound(path.clone()).into())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteFileInfo>, SessionError> {
        let path = self.check(path)?;
        match self.store.info(&path) {
            None => Err(ProtocolError::NotFound(path).into()),
            Some(info) if !info.is_dir => Err(ProtocolError::NotADirectory(path).into()),
            Some(info) => {
                let mut entries = Vec::new();
                if self.store.self_listing.load(Ordering::SeqCst) {
                    entries.push(RemoteFileInfo::from_attributes(&join_remote(&path, "."), info.mode, 0, None, false));
                    entries.push(RemoteFileInfo::from_attributes(&join_remote(&path, ".."), info.mode, 0, None, false));
                    let mut itself = info.clone();
                    itself.name = "current".into();
                    entries.push(itself);
                }
                entries.extend(self.store.children(&path));
                Ok(entries)
            }
        }
    }

    async fn open(&self, path: &str, range: Option<ByteRange>) -> Result<RemoteReader, SessionError> {
        let path = self.check(path)?;
        if self.store.fail_open.lock().unwrap().contains(&path) {
            return Err(ProtocolError::Failure {
                path,
                message: "injected open failure".into(),
            }
            .into());
        }
        for (_, token) in self.store.cancel_on_open.lock().unwrap().iter().filter(|(at, _)| *at == path) {
            token.cancel();
        }
        if self.store.fail_read.lock().unwrap().contains(&path) {
            return Ok(Box::new(FailingReader));
        }
        let data = match self.store.nodes.lock().unwrap().get(&path) {
            Some(Node::File(data)) => data.clone(),
            Some(Node::Dir) => {
                return Err(ProtocolError::Failure {
                    path,
                    message: "is a directory".into(),
                }
                .into())
            }
            None => return Err(ProtocolError::NotFound(path).into()),
        };
        let range = range.unwrap_or_default();
        let start = (range.offset as usize).min(data.len());
        let end = match range.length {
            Some(length) => (start + length as usize).min(data.len()),
            None => data.len(),
        };
        Ok(Box::new(Cursor::new(data[start..end].to_vec())))
    }

    async fn create(&self, path: &str, force: bool) -> Result<RemoteWriter, SessionError> {
        let path = self.check(path)?;
        let mut nodes = self.store.nodes.lock().unwrap();
        match nodes.get(&path) {
            Some(Node::Dir) => {
                return Err(ProtocolError::Failure {
                    path,
                    message: "is a directory".into(),
                }
                .into())
            }
            Some(Node::File(_)) if !force => return Err(ProtocolError::AlreadyExists(path).into()),
            _ => {}
        }
        if !matches!(nodes.get(&parent_of(&path)), Some(Node::Dir)) {
            return Err(ProtocolError::NotFound(path).into());
        }
        nodes.insert(path.clone(), Node::File(Vec::new()));
        let fail = self.store.fail_write.lock().unwrap().contains(&path);
        Ok(Box::new(MemoryWriter {
            store: self.store.clone(),
            path,
            fail,
        }))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<RemoteFileInfo, SessionError> {
        let path = self.check(path)?;
        {
            let mut nodes = self.store.nodes.lock().unwrap();
            if recursive {
                let mut current = String::new();
                for component in path.split('/').filter(|part| !part.is_empty()) {
                    current = join_remote(if current.is_empty() { "/" } else { current.as_str() }, component);
                    match nodes.get(&current) {
                        Some(Node::Dir) => {}
                        Some(Node::File(_)) => return Err(ProtocolError::NotADirectory(current).into()),
                        None => {
                            nodes.insert(current.clone(), Node::Dir);
                        }
                    }
                }
            } else {
                if nodes.contains_key(&path) {
                    return Err(ProtocolError::AlreadyExists(path).into());
                }
                if !matches!(nodes.get(&parent_of(&path)), Some(Node::Dir)) {
                    return Err(ProtocolError::NotFound(path).into());
                }
                nodes.insert(path.clone(), Node::Dir);
            }
        }
        self.stat(&path).await
    }

    async fn remove(&self, path: &str) -> Result<(), SessionError> {
        let path = self.check(path)?;
        if !self.store.exists(&path) {
            return Err(ProtocolError::NotFound(path).into());
        }
        if !self.store.children(&path).is_empty() {
            return Err(ProtocolError::Failure {
                path,
                message: "directory not empty".into(),
            }
            .into());
        }
        self.store.nodes.lock().unwrap().remove(&path);
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), SessionError> {
        let old_path = self.check(old_path)?;
        let new_path = self.check(new_path)?;
        let mut nodes = self.store.nodes.lock().unwrap();
        let node = nodes
            .remove(&old_path)
            .ok_or_else(|| SessionError::from(ProtocolError::NotFound(old_path.clone())))?;
        nodes.insert(new_path, node);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Fails every read the way a server reporting a disk error would.
struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::other("read error on remote disk")))
    }
}

/// Appends straight into the store, so partial writes are visible.
struct MemoryWriter {
    store: Arc<Store>,
    path: String,
    fail: bool,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        if self.fail {
            return Poll::Ready(Err(std::io::Error::other("no space left on remote disk")));
        }
        let mut nodes = self.store.nodes.lock().unwrap();
        match nodes.get_mut(&self.path) {
            Some(Node::File(data)) => {
                data.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} vanished", file_name(&self.path)),
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Dials [`MemoryFs`] sessions and counts how often it was asked to.
pub struct MemoryConnector {
    store: Arc<Store>,
    dials: AtomicUsize,
    delay: Duration,
    host_delays: HashMap<String, Duration>,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new(store: Arc<Store>) -> MemoryConnector {
        MemoryConnector {
            store,
            dials: AtomicUsize::new(0),
            delay: Duration::ZERO,
            host_delays: HashMap::new(),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> MemoryConnector {
        self.delay = delay;
        self
    }

    /// Dials to `host` take `delay` instead of the default.
    pub fn with_host_delay(mut self, host: &str, delay: Duration) -> MemoryConnector {
        self.host_delays.insert(host.to_string(), delay);
        self
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Every further dial fails as if the host were unreachable.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemoryFs;

    async fn connect(&self, target: &SshTarget<'_>) -> Result<MemoryFs, GatewayError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let delay = self.host_delays.get(target.host).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection {
                host: target.host.to_string(),
                port: target.port,
                reason: "connection refused".into(),
            });
        }
        Ok(MemoryFs::new(self.store.clone()))
    }
}
