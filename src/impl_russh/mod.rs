pub mod connection;
mod filesystem;

use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::HostKeyPolicy;

pub use connection::{RusshConnectionError, RusshConnector};

/// A live SSH connection with its SFTP subsystem open.
pub struct RusshSession {
    host: String,
    port: u16,
    handle_mutex: Mutex<client::Handle<HostKeyVerifier>>,
    sftp_session: SftpSession,
    closed: AtomicBool,
}

impl RusshSession {
    fn mark_dead(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(host = %self.host, port = self.port, "session marked dead");
        }
    }
}

impl std::fmt::Debug for RusshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshSession")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Checks the server's host key against the configured policy.
pub struct HostKeyVerifier {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl HostKeyVerifier {
    pub fn new(host: impl Into<String>, port: u16, policy: HostKeyPolicy) -> HostKeyVerifier {
        HostKeyVerifier {
            host: host.into(),
            port,
            policy,
        }
    }

    fn check_known_hosts(&self, path: &Path, key: &PublicKey) -> bool {
        match russh_keys::check_known_hosts_path(&self.host, self.port, key, path) {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    known_hosts = %path.display(),
                    fingerprint = %key.fingerprint(),
                    "host key not present in known_hosts"
                );
                false
            }
            Err(err) => {
                warn!(host = %self.host, port = self.port, error = %err, "host key verification failed");
                false
            }
        }
    }
}

#[async_trait]
impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let accepted = match &self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    fingerprint = %server_public_key.fingerprint(),
                    "accepting host key without verification"
                );
                true
            }
            HostKeyPolicy::Pinned(fingerprints) => {
                let fingerprint = server_public_key.fingerprint();
                let pinned = fingerprints.iter().any(|pinned| *pinned == fingerprint);
                if !pinned {
                    warn!(host = %self.host, port = self.port, %fingerprint, "host key does not match any pinned fingerprint");
                }
                pinned
            }
            HostKeyPolicy::KnownHosts(path) => self.check_known_hosts(path, server_public_key),
        };
        Ok(accepted)
    }
}
