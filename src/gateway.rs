use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    config::GatewayConfig,
    descriptor::{RemoteSystem, SshTarget},
    error::{ConfigError, GatewayError, Status},
    filesystem::{ByteRange, RemoteFilesystem},
    key::ConnectionKey,
    pool::{Connector, SessionPool},
    rpc::{
        AuthenticateRequest, AuthenticateResponse, GetRequest, GetResponse, HealthResponse, ListRequest, ListResponse,
        MkdirRequest, MkdirResponse, PutRequest, PutResponse, RemoveRequest, RemoveResponse, ServingStatus,
        SftpGatewayService, StatRequest, StatResponse, TransferResponse, WithError,
    },
    transfer::{download_target, is_self_reference, TransferEngine, TransferOptions},
};

/// The session a request runs against, and the key it is pooled under.
struct RequestContext<S> {
    key: ConnectionKey,
    session: Arc<S>,
}

/// Serves the RPC surface from one shared session pool.
pub struct Gateway<C: Connector> {
    pool: SessionPool<C>,
    config: GatewayConfig,
    serving: AtomicBool,
}

impl<C: Connector> Gateway<C> {
    pub fn new(connector: C, config: GatewayConfig) -> Gateway<C> {
        Gateway {
            pool: SessionPool::new(connector, config.max_sessions),
            config,
            serving: AtomicBool::new(true),
        }
    }

    pub fn pool(&self) -> &SessionPool<C> {
        &self.pool
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Stops advertising as healthy and closes every pooled session.
    pub async fn shutdown(&self) {
        self.serving.store(false, Ordering::SeqCst);
        self.pool.close_all().await;
    }

    async fn open(
        &self,
        system: &RemoteSystem,
        cancel: &CancellationToken,
    ) -> Result<RequestContext<C::Session>, GatewayError> {
        let target = SshTarget::resolve(system, &self.config)?;
        let key = ConnectionKey::derive(system)?;
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            session = self.pool.acquire(key, &target) => session,
        }?;
        Ok(RequestContext { key, session })
    }

    /// Drops the pooled session when the result shows its transport is gone.
    async fn settle<T>(
        &self,
        context: &RequestContext<C::Session>,
        result: Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        if let Err(err) = &result {
            if err.is_transport() {
                self.pool.invalidate_if_matches(context.key, &context.session).await;
            }
        }
        result
    }

    fn options(&self, force: bool, range: Option<ByteRange>) -> TransferOptions {
        TransferOptions {
            force,
            range,
            chunk_size: self.config.chunk_size,
            max_depth: self.config.max_depth,
        }
    }

    async fn stat_inner(&self, request: &StatRequest, cancel: &CancellationToken) -> Result<StatResponse, GatewayError> {
        require_path("remote_path", &request.remote_path)?;
        let context = self.open(&request.system, cancel).await?;
        let result = context
            .session
            .stat(&request.remote_path)
            .await
            .map_err(|err| GatewayError::session("stat", &request.remote_path, err));
        let info = self.settle(&context, result).await?;
        Ok(StatResponse {
            info: Some(info),
            error: String::new(),
        })
    }

    async fn list_inner(&self, request: &ListRequest, cancel: &CancellationToken) -> Result<ListResponse, GatewayError> {
        require_path("remote_path", &request.remote_path)?;
        let context = self.open(&request.system, cancel).await?;
        let result = context
            .session
            .read_dir(&request.remote_path)
            .await
            .map_err(|err| GatewayError::session("list", &request.remote_path, err));
        let entries = self.settle(&context, result).await?;
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|entry| !is_self_reference(&request.remote_path, entry))
            .collect();
        debug!(entries = entries.len(), "listed directory");
        Ok(ListResponse {
            entries,
            error: String::new(),
        })
    }

    async fn mkdir_inner(&self, request: &MkdirRequest, cancel: &CancellationToken) -> Result<MkdirResponse, GatewayError> {
        require_path("remote_path", &request.remote_path)?;
        let context = self.open(&request.system, cancel).await?;
        let result = context
            .session
            .mkdir(&request.remote_path, request.recursive)
            .await
            .map_err(|err| GatewayError::session("mkdir", &request.remote_path, err));
        let info = self.settle(&context, result).await?;
        Ok(MkdirResponse {
            info: Some(info),
            error: String::new(),
        })
    }

    async fn remove_inner(
        &self,
        request: &RemoveRequest,
        cancel: &CancellationToken,
    ) -> Result<RemoveResponse, GatewayError> {
        require_path("remote_path", &request.remote_path)?;
        let context = self.open(&request.system, cancel).await?;
        let result = context
            .session
            .remove(&request.remote_path)
            .await
            .map_err(|err| GatewayError::session("remove", &request.remote_path, err));
        self.settle(&context, result).await?;
        Ok(RemoveResponse {
            success: true,
            error: String::new(),
        })
    }

    async fn get_inner(&self, request: &GetRequest, cancel: &CancellationToken) -> Result<GetResponse, GatewayError> {
        require_path("remote_path", &request.remote_path)?;
        require_local(&request.local_path)?;
        let context = self.open(&request.system, cancel).await?;

        let result = async {
            let remote = context
                .session
                .stat(&request.remote_path)
                .await
                .map_err(|err| GatewayError::session("stat", &request.remote_path, err))?;
            let local_is_dir = match tokio::fs::metadata(&request.local_path).await {
                Ok(metadata) => metadata.is_dir(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
                Err(err) => return Err(GatewayError::local("stat", &request.local_path, err)),
            };
            let local = download_target(&remote, &request.local_path, local_is_dir);
            TransferEngine::new(
                context.session.as_ref(),
                self.options(request.force, request.range),
                cancel,
            )
            .download(&remote, &local)
            .await
        }
        .await;

        let stats = self.settle(&context, result).await?;
        Ok(TransferResponse {
            bytes_transferred: stats.bytes,
            stats,
            error: String::new(),
        })
    }

    async fn put_inner(&self, request: &PutRequest, cancel: &CancellationToken) -> Result<PutResponse, GatewayError> {
        require_local(&request.local_path)?;
        require_path("remote_path", &request.remote_path)?;
        let context = self.open(&request.system, cancel).await?;
        let result = TransferEngine::new(context.session.as_ref(), self.options(request.force, None), cancel)
            .upload(&request.local_path, &request.remote_path)
            .await;
        let stats = self.settle(&context, result).await?;
        Ok(TransferResponse {
            bytes_transferred: stats.bytes,
            stats,
            error: String::new(),
        })
    }
}

#[async_trait]
impl<C: Connector> SftpGatewayService for Gateway<C> {
    async fn stat(&self, request: StatRequest, cancel: &CancellationToken) -> Result<StatResponse, Status> {
        let span = request_span("stat", &request.system, &request.remote_path);
        respond(self.stat_inner(&request, cancel).instrument(span).await)
    }

    async fn list(&self, request: ListRequest, cancel: &CancellationToken) -> Result<ListResponse, Status> {
        let span = request_span("list", &request.system, &request.remote_path);
        respond(self.list_inner(&request, cancel).instrument(span).await)
    }

    async fn mkdir(&self, request: MkdirRequest, cancel: &CancellationToken) -> Result<MkdirResponse, Status> {
        let span = request_span("mkdir", &request.system, &request.remote_path);
        respond(self.mkdir_inner(&request, cancel).instrument(span).await)
    }

    async fn remove(&self, request: RemoveRequest, cancel: &CancellationToken) -> Result<RemoveResponse, Status> {
        let span = request_span("remove", &request.system, &request.remote_path);
        respond(self.remove_inner(&request, cancel).instrument(span).await)
    }

    async fn get(&self, request: GetRequest, cancel: &CancellationToken) -> Result<GetResponse, Status> {
        let span = request_span("get", &request.system, &request.remote_path);
        respond_transfer(self.get_inner(&request, cancel).instrument(span).await)
    }

    async fn put(&self, request: PutRequest, cancel: &CancellationToken) -> Result<PutResponse, Status> {
        let span = request_span("put", &request.system, &request.remote_path);
        respond_transfer(self.put_inner(&request, cancel).instrument(span).await)
    }

    async fn authenticate(
        &self,
        request: AuthenticateRequest,
        cancel: &CancellationToken,
    ) -> Result<AuthenticateResponse, Status> {
        let span = request_span("authenticate", &request.system, "");
        let result = self.open(&request.system, cancel).instrument(span).await;
        match result {
            Ok(_) => Ok(AuthenticateResponse {
                authenticated: true,
                error: String::new(),
            }),
            Err(err) if err.is_cancelled() => Err(Status::cancelled(err.to_string())),
            // the answer to "can these credentials log in" is in-band, even when it is no
            Err(err) => {
                warn!(error = %err, host = %request.system.host, "authentication failed");
                Ok(AuthenticateResponse::failed(err))
            }
        }
    }

    async fn health(&self) -> HealthResponse {
        let status = if self.serving.load(Ordering::SeqCst) {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        };
        HealthResponse { status }
    }
}

fn request_span(op: &'static str, system: &RemoteSystem, path: &str) -> tracing::Span {
    info_span!(
        "request",
        id = %Uuid::new_v4(),
        op,
        host = %system.host,
        port = system.port,
        path = %path,
    )
}

fn respond<R: WithError>(result: Result<R, GatewayError>) -> Result<R, Status> {
    match result {
        Ok(response) => Ok(response),
        Err(err) => match Status::from_error(&err) {
            Some(status) => {
                warn!(error = %err, code = ?status.code, "request failed");
                Err(status)
            }
            None => {
                debug!(error = %err, "request completed with error");
                Ok(R::failed(err))
            }
        },
    }
}

/// Like [`respond`], but a partial transfer keeps the counters it reached.
fn respond_transfer(result: Result<TransferResponse, GatewayError>) -> Result<TransferResponse, Status> {
    match result {
        Err(GatewayError::PartialTransfer { dir, stats, source }) if Status::from_error(&source).is_none() => {
            let err = GatewayError::PartialTransfer { dir, stats, source };
            debug!(error = %err, "transfer completed partially");
            Ok(TransferResponse {
                bytes_transferred: stats.bytes,
                stats,
                error: err.to_string(),
            })
        }
        other => respond(other),
    }
}

fn require_path(field: &'static str, path: &str) -> Result<(), ConfigError> {
    if path.trim().is_empty() {
        return Err(ConfigError::MissingField(field));
    }
    Ok(())
}

fn require_local(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::MissingField("local_path"));
    }
    Ok(())
}
