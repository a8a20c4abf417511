use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::transfer::TransferStats;

/// Problems with the caller-supplied descriptor or the gateway configuration.
/// Always raised before any network action.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("no authentication material: either a password or a private key is required")]
    NoAuthentication,

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file '{path}': {source}")]
    ReadFile { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A failure reported verbatim by the remote SFTP server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{path}: {message}")]
    Failure { path: String, message: String },
}

/// What an SFTP session adapter call can fail with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The underlying SSH transport is gone; the session must not be reused.
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection to {host}:{port} failed: {reason}")]
    Connection { host: String, port: u16, reason: String },

    #[error("transport failure on '{path}': {reason}")]
    Transport { path: String, reason: String },

    #[error("{op} failed: {source}")]
    Protocol {
        op: &'static str,
        #[source]
        source: ProtocolError,
    },

    #[error("local {op} '{path}' failed: {source}")]
    LocalIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("directory depth limit of {max} exceeded at '{path}'")]
    DepthLimit { path: String, max: usize },

    #[error("transfer aborted in '{dir}' after {stats}: {source}")]
    PartialTransfer {
        dir: String,
        stats: TransferStats,
        #[source]
        source: Box<GatewayError>,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    pub(crate) fn session(op: &'static str, path: &str, err: SessionError) -> GatewayError {
        match err {
            SessionError::Protocol(source) => GatewayError::Protocol { op, source },
            SessionError::Transport(reason) => GatewayError::Transport {
                path: path.to_string(),
                reason,
            },
        }
    }

    pub fn local(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> GatewayError {
        GatewayError::LocalIo {
            op,
            path: path.into(),
            source,
        }
    }

    /// The innermost error, looking through partial transfer wrappers.
    pub fn root_cause(&self) -> &GatewayError {
        match self {
            GatewayError::PartialTransfer { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// True when the failure says nothing about the remote path and everything
    /// about the connection: callers may retry on a fresh session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.root_cause(),
            GatewayError::Connection { .. } | GatewayError::Transport { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), GatewayError::Cancelled)
    }
}

/// RPC-level status codes, following the usual RPC status conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Unavailable,
    Cancelled,
}

/// RPC-level failure. Only connection problems and cancellations travel this way;
/// every other failure is reported inside the response's `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    /// The RPC status a gateway error must surface as, if any.
    pub fn from_error(err: &GatewayError) -> Option<Status> {
        if err.is_cancelled() {
            Some(Status::cancelled(err.to_string()))
        } else if err.is_transport() {
            Some(Status::unavailable(err.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}
