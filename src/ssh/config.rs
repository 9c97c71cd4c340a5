//! SSH Configuration

use std::fmt;

use zeroize::Zeroizing;

use super::error::SshError;
use crate::backend::{BackendDescriptor, Credential};

/// SSH connection configuration for one controller dial
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Bound on connect + handshake + authentication, in seconds
    pub timeout_secs: u64,
}

/// Authentication methods supported
#[derive(Clone)]
pub enum AuthMethod {
    /// Password authentication
    Password { password: Zeroizing<String> },

    /// Private key authentication; the key text itself, not a path
    KeyData {
        key_pem: Zeroizing<String>,
        passphrase: Option<Zeroizing<String>>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn key_data(key_pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::KeyData {
            key_pem: Zeroizing::new(key_pem.into()),
            passphrase: passphrase.map(Zeroizing::new),
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password"),
            AuthMethod::KeyData { passphrase, .. } => f
                .debug_struct("KeyData")
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    20
}

impl SshConfig {
    /// Build the dial configuration for an SSH-reachable controller
    pub fn for_controller(
        descriptor: &BackendDescriptor,
        port: u16,
        timeout_secs: u64,
    ) -> Result<Self, SshError> {
        let (username, auth) = match &descriptor.credential {
            Credential::Password { username, password } => (
                username.clone(),
                AuthMethod::Password {
                    password: password.clone(),
                },
            ),
            Credential::PrivateKey {
                username,
                key_pem,
                passphrase,
            } => (
                username.clone(),
                AuthMethod::KeyData {
                    key_pem: key_pem.clone(),
                    passphrase: passphrase.clone(),
                },
            ),
            Credential::None => {
                return Err(SshError::AuthenticationFailed(format!(
                    "no credential configured for cluster {}",
                    descriptor.id
                )))
            }
        };

        Ok(Self {
            host: descriptor.address.clone(),
            port,
            username,
            auth,
            timeout_secs,
        })
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth: AuthMethod::password(String::new()),
            timeout_secs: default_timeout(),
        }
    }
}
