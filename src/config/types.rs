//! Configuration file types

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{BackendDescriptor, BackendId, Credential, StaticRegistry};
use crate::bridge::SessionConfig;
use crate::pool::ConnectionPoolConfig;
use crate::ssh::PodExecConfig;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

fn default_version() -> u32 {
    CONFIG_VERSION
}

/// Root of `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pool: ConnectionPoolConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub pod_exec: PodExecConfig,

    /// Docker-compatible engines, keyed by host id
    #[serde(default)]
    pub docker_hosts: Vec<DockerHostEntry>,

    /// SSH-reachable cluster controllers, keyed by cluster id
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: ServerConfig::default(),
            pool: ConnectionPoolConfig::default(),
            session: SessionConfig::default(),
            pod_exec: PodExecConfig::default(),
            docker_hosts: Vec::new(),
            clusters: Vec::new(),
        }
    }
}

impl ConfigFile {
    pub fn docker_registry(&self) -> StaticRegistry {
        StaticRegistry::from_descriptors(self.docker_hosts.iter().map(DockerHostEntry::descriptor))
    }

    pub fn cluster_registry(&self) -> StaticRegistry {
        StaticRegistry::from_descriptors(self.clusters.iter().map(ClusterEntry::descriptor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// A Docker host as stored by host management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerHostEntry {
    pub id: BackendId,
    #[serde(default)]
    pub name: String,
    /// `unix:///var/run/docker.sock`, `tcp://10.0.0.5:2375`, ...
    pub uri: String,
}

impl DockerHostEntry {
    pub fn descriptor(&self) -> BackendDescriptor {
        let descriptor = BackendDescriptor::docker(self.id, self.uri.clone());
        if self.name.is_empty() {
            descriptor
        } else {
            descriptor.with_name(self.name.clone())
        }
    }
}

/// A cluster controller reachable over SSH
#[derive(Clone, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: BackendId,
    #[serde(default)]
    pub name: String,
    pub ip_address: String,
    pub username: String,
    /// `password` (default) or `ssh-key`
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Private key text (PEM / OpenSSH), not a path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
}

fn default_auth_method() -> String {
    "password".to_string()
}

impl ClusterEntry {
    pub fn credential(&self) -> Credential {
        match self.auth_method.as_str() {
            "ssh-key" => Credential::private_key(
                self.username.clone(),
                self.ssh_key.clone().unwrap_or_default(),
            ),
            "password" => {
                Credential::password(self.username.clone(), self.password.clone().unwrap_or_default())
            }
            other => {
                warn!(
                    "Cluster {} has unknown auth method {:?}, using password",
                    self.id, other
                );
                Credential::password(self.username.clone(), self.password.clone().unwrap_or_default())
            }
        }
    }

    pub fn descriptor(&self) -> BackendDescriptor {
        let descriptor = BackendDescriptor::ssh(self.id, self.ip_address.clone(), self.credential());
        if self.name.is_empty() {
            descriptor
        } else {
            descriptor.with_name(self.name.clone())
        }
    }
}

impl fmt::Debug for ClusterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ip_address", &self.ip_address)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("has_password", &self.password.is_some())
            .field("has_ssh_key", &self.ssh_key.is_some())
            .finish()
    }
}
