//! Shared server state

use std::sync::Arc;

use tracing::info;

use super::access::{AccessPolicy, AllowAll};
use crate::backend::{BackendDescriptor, BackendId, StaticRegistry};
use crate::bridge::SessionConfig;
use crate::pool::{ConnectionPool, ConnectionPoolStats, Connector};
use crate::ssh::PodExecConfig;

/// Everything a connection handler needs, shared across sessions
pub struct AppState<C: Connector> {
    pub pool: Arc<ConnectionPool<C>>,
    /// The same registry the pool resolves engine ids against
    pub docker_hosts: Arc<StaticRegistry>,
    pub clusters: Arc<StaticRegistry>,
    pub access: Arc<dyn AccessPolicy>,
    pub session: SessionConfig,
    pub pod_exec: PodExecConfig,
}

impl<C: Connector> AppState<C> {
    pub fn new(
        pool: Arc<ConnectionPool<C>>,
        docker_hosts: Arc<StaticRegistry>,
        clusters: Arc<StaticRegistry>,
    ) -> Self {
        Self {
            pool,
            docker_hosts,
            clusters,
            access: Arc::new(AllowAll),
            session: SessionConfig::default(),
            pod_exec: PodExecConfig::default(),
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    pub fn with_pod_exec_config(mut self, config: PodExecConfig) -> Self {
        self.pod_exec = config;
        self
    }

    /// Add or replace a Docker host. A replaced host's pooled client is
    /// dropped so the next session dials the new address.
    pub fn upsert_docker_host(&self, descriptor: BackendDescriptor) {
        let id = descriptor.id;
        if self.docker_hosts.upsert(descriptor).is_some() {
            self.pool.invalidate(id);
        }
    }

    /// Remove a Docker host and its pooled client. Running sessions keep
    /// their handle until they end.
    pub fn remove_docker_host(&self, id: BackendId) -> bool {
        let removed = self.docker_hosts.remove(id).is_some();
        let invalidated = self.pool.invalidate(id);
        if removed {
            info!("Docker host {} removed (pooled client dropped: {})", id, invalidated);
        }
        removed
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        self.pool.stats()
    }
}
