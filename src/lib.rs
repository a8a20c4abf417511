pub mod config;
pub mod descriptor;
pub mod error;
pub mod filesystem;
pub mod gateway;
pub mod key;
pub mod logging;
pub mod pool;
pub mod rpc;
pub mod transfer;

#[cfg(feature = "impl-russh")]
pub mod impl_russh;

pub use config::GatewayConfig;
pub use descriptor::RemoteSystem;
pub use error::{Code, GatewayError, Status};
pub use gateway::Gateway;
pub use key::ConnectionKey;
pub use pool::{Connector, SessionPool};
pub use transfer::TransferStats;
