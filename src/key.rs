use std::fmt;

use sha2::{Digest, Sha256};

use crate::{
    descriptor::{AuthMethod, RemoteSystem},
    error::ConfigError,
};

/// Identifies one pooled SSH session. Two descriptors share a key exactly when
/// they would authenticate the same way as the same user to the same endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey([u8; 32]);

impl ConnectionKey {
    pub fn derive(system: &RemoteSystem) -> Result<ConnectionKey, ConfigError> {
        let auth = system.auth_method()?;

        let mut hasher = Sha256::new();
        // every field is length-prefixed so no two field sets encode to the same bytes
        let mut field = |value: &[u8]| {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value);
        };
        field(auth.tag().as_bytes());
        field(system.username.as_bytes());
        match auth {
            AuthMethod::PublicKey { key, passphrase } => {
                field(key.as_bytes());
                field(passphrase.unwrap_or_default().as_bytes());
            }
            AuthMethod::Password { password } => field(password.as_bytes()),
        }
        field(system.host.trim().as_bytes());
        field(&system.port.to_be_bytes());
        field(system.client_key.as_deref().unwrap_or_default().as_bytes());

        Ok(ConnectionKey(hasher.finalize().into()))
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "ConnectionKey({})", &hex[..12])
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn alice() -> RemoteSystem {
        RemoteSystem::with_password("example.com", 22, "alice", "hunter2")
    }

    #[test]
    fn equal_descriptors_share_a_key() {
        assert_eq!(
            ConnectionKey::derive(&alice()).unwrap(),
            ConnectionKey::derive(&alice()).unwrap()
        );
    }

    #[test]
    fn surrounding_whitespace_in_host_is_ignored() {
        let mut padded = alice();
        padded.host = " example.com ".into();
        assert_eq!(
            ConnectionKey::derive(&padded).unwrap(),
            ConnectionKey::derive(&alice()).unwrap()
        );
    }

    #[test]
    fn any_field_change_changes_the_key() {
        let base = ConnectionKey::derive(&alice()).unwrap();
        let variants = [
            RemoteSystem::with_password("example.com", 22, "alice", "hunter3"),
            RemoteSystem::with_password("example.org", 22, "alice", "hunter2"),
            RemoteSystem::with_password("example.com", 2222, "alice", "hunter2"),
            RemoteSystem::with_password("example.com", 22, "bob", "hunter2"),
            alice().client_key("tenant-a"),
        ];
        for variant in &variants {
            assert_ne!(ConnectionKey::derive(variant).unwrap(), base, "{variant:?}");
        }
    }

    #[test]
    fn auth_type_is_part_of_the_key() {
        // same secret bytes, once as a password and once as key material
        let password = RemoteSystem::with_password("example.com", 22, "alice", "material");
        let key = RemoteSystem::with_private_key("example.com", 22, "alice", "material", None);
        let key_with_pass =
            RemoteSystem::with_private_key("example.com", 22, "alice", "material", Some(String::new()));
        assert_ne!(
            ConnectionKey::derive(&password).unwrap(),
            ConnectionKey::derive(&key).unwrap()
        );
        // an empty passphrase is no passphrase
        assert_eq!(
            ConnectionKey::derive(&key).unwrap(),
            ConnectionKey::derive(&key_with_pass).unwrap()
        );

        let mut with_pass = RemoteSystem::with_private_key("example.com", 22, "alice", "material", None);
        with_pass.passphrase = Some(SecretString::from("pass".to_string()));
        assert_ne!(
            ConnectionKey::derive(&with_pass).unwrap(),
            ConnectionKey::derive(&key).unwrap()
        );
    }

    #[test]
    fn field_boundaries_cannot_be_shifted() {
        let a = RemoteSystem::with_password("example.com", 22, "ab", "c");
        let b = RemoteSystem::with_password("example.com", 22, "a", "bc");
        assert_ne!(ConnectionKey::derive(&a).unwrap(), ConnectionKey::derive(&b).unwrap());
    }

    #[test]
    fn display_is_full_hex_and_debug_is_short() {
        let key = ConnectionKey::derive(&alice()).unwrap();
        assert_eq!(key.to_string().len(), 64);
        assert_eq!(format!("{key:?}").len(), "ConnectionKey()".len() + 12);
    }

    #[test]
    fn missing_credentials_fail() {
        let system = RemoteSystem::with_password("example.com", 22, "alice", "");
        assert!(matches!(
            ConnectionKey::derive(&system),
            Err(ConfigError::NoAuthentication)
        ));
    }
}
