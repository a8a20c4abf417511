use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::ConfigError;

/// Gateway-wide policy. None of this is negotiable per request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub dial_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub keepalive_max: usize,
    /// Upper bound on pooled sessions, least recently used evicted first. Unbounded when unset.
    pub max_sessions: Option<usize>,
    /// Deepest directory level a recursive transfer may descend to.
    pub max_depth: usize,
    pub chunk_size: usize,
    pub log_dir: Option<PathBuf>,
    pub host_keys: HostKeyConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            dial_timeout_secs: 60,
            keepalive_secs: 60,
            keepalive_max: 3,
            max_sessions: None,
            max_depth: 64,
            chunk_size: 32 * 1024,
            log_dir: None,
            host_keys: HostKeyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostKeyConfig {
    pub policy: HostKeyPolicyKind,
    pub known_hosts_path: Option<PathBuf>,
    /// SHA-256 fingerprints, with or without the `SHA256:` prefix.
    pub fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicyKind {
    #[default]
    KnownHosts,
    Pinned,
    AcceptAny,
}

/// Resolved host key verification policy handed to the SSH backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    KnownHosts(PathBuf),
    Pinned(Vec<String>),
    /// Blind acceptance. Only ever selected explicitly.
    AcceptAny,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        GatewayConfig::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<GatewayConfig, ConfigError> {
        let config: GatewayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dial_timeout_secs == 0 {
            return Err(invalid("dial_timeout_secs", "must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size", "must be positive"));
        }
        if self.max_depth == 0 {
            return Err(invalid("max_depth", "must be positive"));
        }
        if self.max_sessions == Some(0) {
            return Err(invalid("max_sessions", "must be positive when set"));
        }
        if self.host_keys.policy == HostKeyPolicyKind::Pinned && self.host_keys.fingerprints.is_empty() {
            return Err(invalid("host_keys.fingerprints", "pinned policy needs at least one fingerprint"));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn host_key_policy(&self) -> Result<HostKeyPolicy, ConfigError> {
        match self.host_keys.policy {
            HostKeyPolicyKind::AcceptAny => Ok(HostKeyPolicy::AcceptAny),
            HostKeyPolicyKind::Pinned => Ok(HostKeyPolicy::Pinned(
                self.host_keys
                    .fingerprints
                    .iter()
                    .map(|fp| fp.trim_start_matches("SHA256:").to_string())
                    .collect(),
            )),
            HostKeyPolicyKind::KnownHosts => {
                let path = match &self.host_keys.known_hosts_path {
                    Some(path) => path.clone(),
                    None => dirs::home_dir()
                        .map(|home| home.join(".ssh").join("known_hosts"))
                        .ok_or_else(|| invalid("host_keys.known_hosts_path", "no home directory to default to"))?,
                };
                Ok(HostKeyPolicy::KnownHosts(path))
            }
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
