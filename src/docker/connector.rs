//! Engine client construction

use std::time::Duration;

use async_trait::async_trait;
use bollard::{Docker, API_DEFAULT_VERSION};
use tracing::{info, warn};

use crate::backend::{BackendDescriptor, TransportKind};
use crate::pool::{Connector, PoolError};

/// Per-request timeout handed to the engine client (seconds)
const ENGINE_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Builds `bollard::Docker` clients for engine descriptors
#[derive(Debug, Clone)]
pub struct DockerConnector {
    /// Ping the engine before handing the client to the pool
    ping: bool,
}

impl DockerConnector {
    pub fn new() -> Self {
        Self { ping: true }
    }

    /// Skip the liveness ping; the first exec surfaces connection problems
    pub fn without_ping() -> Self {
        Self { ping: false }
    }

    fn build(descriptor: &BackendDescriptor) -> Result<Docker, PoolError> {
        let id = descriptor.id;
        let address = descriptor.address.trim();
        let connect_failed = |e: bollard::errors::Error| PoolError::ConnectFailed {
            id,
            reason: e.to_string(),
        };

        match descriptor.transport {
            TransportKind::LocalSocket => connect_local_socket(address).map_err(connect_failed),
            TransportKind::TcpEndpoint if address.starts_with("https://") => {
                Err(PoolError::ConnectFailed {
                    id,
                    reason: "TLS engine endpoints are not supported".to_string(),
                })
            }
            TransportKind::TcpEndpoint => {
                Docker::connect_with_http(address, ENGINE_REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
                    .map_err(connect_failed)
            }
            TransportKind::SshHost => Err(PoolError::UnsupportedTransport {
                id,
                transport: descriptor.transport,
            }),
        }
    }
}

impl Default for DockerConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn connect_local_socket(address: &str) -> Result<Docker, bollard::errors::Error> {
    Docker::connect_with_unix(address, ENGINE_REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
}

#[cfg(windows)]
fn connect_local_socket(address: &str) -> Result<Docker, bollard::errors::Error> {
    Docker::connect_with_named_pipe(address, ENGINE_REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
}

#[async_trait]
impl Connector for DockerConnector {
    type Client = Docker;

    async fn connect(&self, descriptor: &BackendDescriptor) -> Result<Docker, PoolError> {
        let docker = Self::build(descriptor)?;

        if self.ping {
            docker.ping().await.map_err(|e| PoolError::ConnectFailed {
                id: descriptor.id,
                reason: format!("ping failed: {}", e),
            })?;
        }

        Ok(docker)
    }
}

/// Connect to the local engine from environment defaults (`DOCKER_HOST` or
/// the platform socket) and keep it only if it answers a ping in time.
pub async fn connect_local_fallback(ping_timeout: Duration) -> Option<Docker> {
    let docker = match Docker::connect_with_local_defaults() {
        Ok(docker) => docker,
        Err(e) => {
            warn!("Failed to create local Docker client: {}", e);
            return None;
        }
    };

    match tokio::time::timeout(ping_timeout, docker.ping()).await {
        Ok(Ok(_)) => {
            info!("Local Docker daemon reachable, installed as fallback for host 1");
            Some(docker)
        }
        Ok(Err(e)) => {
            warn!("Local Docker daemon not reachable: {}", e);
            None
        }
        Err(_) => {
            warn!(
                "Local Docker daemon ping timed out after {}s",
                ping_timeout.as_secs()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendId;

    #[tokio::test]
    async fn test_tcp_descriptor_builds_client() {
        let connector = DockerConnector::without_ping();
        let descriptor = BackendDescriptor::docker(BackendId(2), "tcp://127.0.0.1:2375");
        assert!(connector.connect(&descriptor).await.is_ok());
    }

    #[tokio::test]
    async fn test_ssh_descriptor_rejected() {
        let connector = DockerConnector::without_ping();
        let descriptor = BackendDescriptor::docker(BackendId(3), "ssh://root@10.0.0.3");
        let err = connector.connect(&descriptor).await.err().unwrap();
        assert!(matches!(
            err,
            PoolError::UnsupportedTransport {
                transport: TransportKind::SshHost,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_tls_descriptor_rejected() {
        let connector = DockerConnector::without_ping();
        let descriptor = BackendDescriptor::docker(BackendId(4), "https://10.0.0.4:2376");
        let err = connector.connect(&descriptor).await.err().unwrap();
        assert!(err.to_string().contains("TLS"));
    }
}
