use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sftp_gateway::{
    filesystem::ByteRange,
    impl_russh::RusshConnector,
    logging::init_logging,
    rpc::{
        AuthenticateRequest, GetRequest, ListRequest, MkdirRequest, PutRequest, RemoveRequest, SftpGatewayService,
        StatRequest, WithError,
    },
    Gateway, GatewayConfig, GatewayError, RemoteSystem, Status,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "sftpgw",
    version,
    about = "Run single SFTP gateway operations against a remote host",
    after_help = "EXAMPLES:\n  sftpgw --host files.local --user deploy --key-file ~/.ssh/id_ed25519 ls /srv\n  SFTPGW_PASSWORD=secret sftpgw --host files.local --user deploy get /srv/data ./data"
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[arg(long, help = "Gateway configuration file (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Write a daily rotated log file into this directory")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 22)]
    port: u16,

    #[arg(short, long)]
    user: String,

    #[arg(long, env = "SFTPGW_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(short = 'i', long, help = "Private key file; takes precedence over --password")]
    key_file: Option<PathBuf>,

    #[arg(long, env = "SFTPGW_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[arg(long, help = "Keeps this invocation's pooled session apart from identical ones")]
    client_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show attributes of a remote path
    Stat { path: String },
    /// List a remote directory
    Ls { path: String },
    /// Create a remote directory
    Mkdir {
        path: String,
        #[arg(short, long)]
        parents: bool,
    },
    /// Remove a remote file or empty directory
    Rm { path: String },
    /// Download a remote file or directory tree
    Get {
        remote: String,
        local: PathBuf,
        #[arg(short, long)]
        force: bool,
        #[arg(long, help = "Start reading at this byte offset")]
        offset: Option<u64>,
        #[arg(long, help = "Read at most this many bytes")]
        length: Option<u64>,
    },
    /// Upload a local file or directory tree
    Put {
        local: PathBuf,
        remote: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Check that the credentials can log in
    Auth,
}

impl ConnectionArgs {
    async fn remote_system(&self) -> Result<RemoteSystem, GatewayError> {
        let system = match &self.key_file {
            Some(path) => {
                let key = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| GatewayError::local("read key", path, err))?;
                RemoteSystem::with_private_key(&self.host, self.port, &self.user, key, self.passphrase.clone())
            }
            None => RemoteSystem::with_password(
                &self.host,
                self.port,
                &self.user,
                self.password.clone().unwrap_or_default(),
            ),
        };
        Ok(match &self.client_key {
            Some(client_key) => system.client_key(client_key),
            None => system,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match GatewayConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::from(2);
            }
        },
        None => GatewayConfig::default(),
    };
    let _guard = init_logging(cli.log_dir.clone().or_else(|| config.log_dir.clone()));

    let system = match cli.connection.remote_system().await {
        Ok(system) => system,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            ctrl_c.cancel();
        }
    });

    let gateway = Gateway::new(RusshConnector, config);
    debug!(host = %system.host, port = system.port, "gateway ready");
    let code = run(&gateway, cli.command, system, &cancel).await;
    gateway.shutdown().await;
    code
}

async fn run(
    gateway: &Gateway<RusshConnector>,
    command: Command,
    system: RemoteSystem,
    cancel: &CancellationToken,
) -> ExitCode {
    match command {
        Command::Stat { path } => {
            let request = StatRequest {
                system,
                remote_path: path,
            };
            emit(gateway.stat(request, cancel).await)
        }
        Command::Ls { path } => {
            let request = ListRequest {
                system,
                remote_path: path,
            };
            emit(gateway.list(request, cancel).await)
        }
        Command::Mkdir { path, parents } => {
            let request = MkdirRequest {
                system,
                remote_path: path,
                recursive: parents,
            };
            emit(gateway.mkdir(request, cancel).await)
        }
        Command::Rm { path } => {
            let request = RemoveRequest {
                system,
                remote_path: path,
            };
            emit(gateway.remove(request, cancel).await)
        }
        Command::Get {
            remote,
            local,
            force,
            offset,
            length,
        } => {
            let range = (offset.is_some() || length.is_some()).then(|| ByteRange {
                offset: offset.unwrap_or(0),
                length,
            });
            let request = GetRequest {
                system,
                remote_path: remote,
                local_path: local,
                force,
                range,
            };
            let result = gateway.get(request, cancel).await;
            if let Ok(response) = &result {
                info!(stats = %response.stats, runtime = ?response.stats.runtime, "download finished");
            }
            emit(result)
        }
        Command::Put { local, remote, force } => {
            let request = PutRequest {
                system,
                local_path: local,
                remote_path: remote,
                force,
            };
            let result = gateway.put(request, cancel).await;
            if let Ok(response) = &result {
                info!(stats = %response.stats, runtime = ?response.stats.runtime, "upload finished");
            }
            emit(result)
        }
        Command::Auth => emit(gateway.authenticate(AuthenticateRequest { system }, cancel).await),
    }
}

/// Prints the response as JSON. In-band errors exit with 1, RPC statuses with 2.
fn emit<R: Serialize + WithError>(result: Result<R, Status>) -> ExitCode {
    match result {
        Ok(response) => {
            match serde_json::to_string_pretty(&response) {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    eprintln!("error: could not encode response: {err}");
                    return ExitCode::from(2);
                }
            }
            if response.error().is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(status) => {
            eprintln!("error: {status}");
            ExitCode::from(2)
        }
    }
}
