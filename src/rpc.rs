//! Request and response records of the gateway's RPC surface.
//!
//! Every response carries an `error` string. An empty string means success; a
//! non-empty one means the remote or local side refused the operation while the
//! call itself completed. Connection failures and cancellations are not reported
//! this way: they come back as an RPC [`Status`] so that callers can tell "retry
//! on a new connection" apart from "the path is wrong".

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    descriptor::RemoteSystem,
    error::Status,
    filesystem::{ByteRange, RemoteFileInfo},
    transfer::TransferStats,
};

#[derive(Debug)]
pub struct StatRequest {
    pub system: RemoteSystem,
    pub remote_path: String,
}

#[derive(Debug)]
pub struct ListRequest {
    pub system: RemoteSystem,
    pub remote_path: String,
}

#[derive(Debug)]
pub struct MkdirRequest {
    pub system: RemoteSystem,
    pub remote_path: String,
    pub recursive: bool,
}

#[derive(Debug)]
pub struct RemoveRequest {
    pub system: RemoteSystem,
    pub remote_path: String,
}

#[derive(Debug)]
pub struct GetRequest {
    pub system: RemoteSystem,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub force: bool,
    pub range: Option<ByteRange>,
}

#[derive(Debug)]
pub struct PutRequest {
    pub system: RemoteSystem,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub force: bool,
}

#[derive(Debug)]
pub struct AuthenticateRequest {
    pub system: RemoteSystem,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatResponse {
    pub info: Option<RemoteFileInfo>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListResponse {
    pub entries: Vec<RemoteFileInfo>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MkdirResponse {
    pub info: Option<RemoteFileInfo>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoveResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferResponse {
    pub bytes_transferred: u64,
    pub stats: TransferStats,
    pub error: String,
}

pub type GetResponse = TransferResponse;
pub type PutResponse = TransferResponse;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthenticateResponse {
    pub authenticated: bool,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    #[default]
    Unknown,
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: ServingStatus,
}

/// Response records that can carry an in-band error.
pub trait WithError: Default {
    fn error(&self) -> &str;

    fn set_error(&mut self, error: String);

    fn failed(error: impl ToString) -> Self {
        let mut response = Self::default();
        response.set_error(error.to_string());
        response
    }
}

macro_rules! with_error {
    ($($response:ty),* $(,)?) => {
        $(impl WithError for $response {
            fn error(&self) -> &str {
                &self.error
            }

            fn set_error(&mut self, error: String) {
                self.error = error;
            }
        })*
    };
}

with_error!(
    StatResponse,
    ListResponse,
    MkdirResponse,
    RemoveResponse,
    TransferResponse,
    AuthenticateResponse,
);

/// The RPC service. Transport bindings (gRPC, HTTP, in-process) sit on top of this.
#[async_trait]
pub trait SftpGatewayService: Send + Sync {
    async fn stat(&self, request: StatRequest, cancel: &CancellationToken) -> Result<StatResponse, Status>;

    async fn list(&self, request: ListRequest, cancel: &CancellationToken) -> Result<ListResponse, Status>;

    async fn mkdir(&self, request: MkdirRequest, cancel: &CancellationToken) -> Result<MkdirResponse, Status>;

    async fn remove(&self, request: RemoveRequest, cancel: &CancellationToken) -> Result<RemoveResponse, Status>;

    async fn get(&self, request: GetRequest, cancel: &CancellationToken) -> Result<GetResponse, Status>;

    async fn put(&self, request: PutRequest, cancel: &CancellationToken) -> Result<PutResponse, Status>;

    async fn authenticate(
        &self,
        request: AuthenticateRequest,
        cancel: &CancellationToken,
    ) -> Result<AuthenticateResponse, Status>;

    async fn health(&self) -> HealthResponse;
}
