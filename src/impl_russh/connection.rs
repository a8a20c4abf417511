use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use async_trait::async_trait;
use russh::client;
use russh_sftp::client::SftpSession;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    descriptor::{AuthMethod, SshTarget},
    error::GatewayError,
    pool::Connector,
};

use super::{HostKeyVerifier, RusshSession};

#[derive(Debug, thiserror::Error)]
pub enum RusshConnectionError {
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not establish connection: {0}")]
    Connect(russh::Error),
    #[error("could not decode private key: {0}")]
    KeyDecode(russh_keys::Error),
    #[error("authentication request failed: {0}")]
    Authentication(russh::Error),
    #[error("server rejected the {0} credentials")]
    Rejected(&'static str),
    #[error("could not open session channel: {0}")]
    ChannelOpen(russh::Error),
    #[error("sftp subsystem request failed: {0}")]
    SftpRequest(russh::Error),
    #[error("could not start sftp session: {0}")]
    SftpOpen(russh_sftp::client::error::Error),
}

/// Dials real SSH servers with russh and opens the SFTP subsystem on each.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

#[async_trait]
impl Connector for RusshConnector {
    type Session = RusshSession;

    async fn connect(&self, target: &SshTarget<'_>) -> Result<RusshSession, GatewayError> {
        let result = match tokio::time::timeout(target.dial_timeout, RusshSession::connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(RusshConnectionError::Timeout(target.dial_timeout)),
        };
        result.map_err(|err| GatewayError::Connection {
            host: target.host.to_string(),
            port: target.port,
            reason: err.to_string(),
        })
    }
}

impl RusshSession {
    pub async fn connect(target: &SshTarget<'_>) -> Result<RusshSession, RusshConnectionError> {
        let config = client::Config {
            keepalive_interval: Some(target.keepalive),
            keepalive_max: target.keepalive_max,
            ..Default::default()
        };
        let handler = HostKeyVerifier::new(target.host, target.port, target.host_key_policy.clone());

        let mut handle = client::connect(Arc::new(config), (target.host, target.port), handler)
            .await
            .map_err(RusshConnectionError::Connect)?;
        debug!(host = %target.host, port = target.port, "transport established");

        let authenticated = match &target.auth {
            AuthMethod::Password { password } => handle.authenticate_password(target.username, *password).await,
            AuthMethod::PublicKey { key, passphrase } => {
                let key_pair = russh_keys::decode_secret_key(key, *passphrase).map_err(RusshConnectionError::KeyDecode)?;
                handle.authenticate_publickey(target.username, Arc::new(key_pair)).await
            }
        }
        .map_err(RusshConnectionError::Authentication)?;
        if !authenticated {
            return Err(RusshConnectionError::Rejected(target.auth.tag()));
        }

        let sftp_channel = handle
            .channel_open_session()
            .await
            .map_err(RusshConnectionError::ChannelOpen)?;
        sftp_channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(RusshConnectionError::SftpRequest)?;
        let sftp_session = SftpSession::new(sftp_channel.into_stream())
            .await
            .map_err(RusshConnectionError::SftpOpen)?;

        info!(host = %target.host, port = target.port, user = %target.username, "sftp session open");
        Ok(RusshSession {
            host: target.host.to_string(),
            port: target.port,
            handle_mutex: Mutex::new(handle),
            sftp_session,
            closed: AtomicBool::new(false),
        })
    }
}
