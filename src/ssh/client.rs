//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;

/// Dials one controller and authenticates
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect and authenticate, bounded by the configured timeout
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let target = format!("{}:{}", self.config.host, self.config.port);

        tokio::time::timeout(timeout, self.connect_inner())
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "Connection to {} timed out after {}s",
                    target,
                    timeout.as_secs()
                ))
            })?
    }

    async fn connect_inner(self) -> Result<Handle<ClientHandler>, SshError> {
        info!(
            "Connecting to SSH server at {}:{}",
            self.config.host, self.config.port
        );

        // Sessions are short-lived; keepalive catches half-open controllers
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.config.host.clone(), self.config.port);

        let mut handle = client::connect(
            Arc::new(ssh_config),
            (self.config.host.as_str(), self.config.port),
            handler,
        )
        .await
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password.as_str())
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::KeyData {
                key_pem,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(
                    key_pem.as_str(),
                    passphrase.as_ref().map(|p| p.as_str()),
                )
                .map_err(|e| SshError::KeyError(e.to_string()))?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!(
            "SSH authentication successful for {}@{}",
            self.config.username, self.config.host
        );
        Ok(handle)
    }
}

/// Client handler for russh callbacks
///
/// Host key verification is disabled: every server key is accepted and only
/// its fingerprint is logged. Controllers are addressed by IP from the cluster
/// inventory and are re-provisioned with fresh host keys, so there is no
/// known_hosts store to check against. Treat the SSH hop as an unauthenticated
/// transport when reasoning about the trust boundary.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            "Accepting unverified host key for {}:{} (fingerprint: {})",
            self.host,
            self.port,
            server_public_key.fingerprint(Default::default())
        );
        Ok(true)
    }
}
