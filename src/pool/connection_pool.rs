//! Backend Connection Pool
//!
//! Keyed cache of live backend clients, independent of any endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ConnectionPool<C: Connector>                                │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  PoolEntry (one per BackendId)                         │  │
//! │  │  ├── cell: OnceCell<Result<ClientHandle, PoolError>>   │  │
//! │  │  ├── created_at                                        │  │
//! │  │  └── last_used: AtomicU64                              │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!          │
//!          │  ClientHandle (Arc clone)
//!          │
//!    ┌─────┴─────┬─────────────┐
//!    ▼           ▼             ▼
//! Session 1   Session 2    Session 3
//! ```
//!
//! # Construction
//!
//! The entry for an unseen id is inserted as an empty cell before the
//! connector runs. Every racer awaits the same cell, so exactly one connection
//! attempt happens per entry and every racer observes the same outcome.
//! A failed outcome is dropped from the map; the next `acquire` starts over.
//! A handle whose descriptor was removed or replaced in the registry while
//! it was being built is dropped too, and the acquire resolves again.
//!
//! # Eviction
//!
//! `EvictionPolicy::Never` (default) keeps handles for the pool lifetime.
//! `EvictionPolicy::Idle` drops handles unused for `idle_secs`; sessions that
//! already hold a handle keep it until they finish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handle::ClientHandle;
use crate::backend::{BackendDescriptor, BackendId, HostRegistry, RegistryError, TransportKind};

/// Default bound on one connection construction (10 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default reaper tick (60 seconds)
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Default ping bound for the local fallback client (5 seconds)
const DEFAULT_LOCAL_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds attempted per acquire when the registry keeps changing underneath
const MAX_BUILD_ATTEMPTS: usize = 3;

/// What happens to handles nobody has asked for in a while
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep every handle until it is invalidated or the pool closes
    #[default]
    Never,
    /// Drop handles not acquired for `idle_secs`
    Idle { idle_secs: u64 },
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Bound on one connection construction (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub eviction: EvictionPolicy,

    /// How often the idle reaper runs (seconds), ignored for `Never`
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Connect to the local engine at startup and use it for id 1 when the
    /// registry has no entry for it
    #[serde(default = "default_true")]
    pub local_fallback: bool,

    #[serde(default = "default_local_ping_timeout_secs")]
    pub local_ping_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_reap_interval_secs() -> u64 {
    DEFAULT_REAP_INTERVAL.as_secs()
}

fn default_local_ping_timeout_secs() -> u64 {
    DEFAULT_LOCAL_PING_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            eviction: EvictionPolicy::Never,
            reap_interval_secs: default_reap_interval_secs(),
            local_fallback: true,
            local_ping_timeout_secs: default_local_ping_timeout_secs(),
        }
    }
}

/// Pool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("host not found: {0}")]
    HostNotFound(BackendId),

    #[error("host registry error: {0}")]
    Registry(String),

    #[error("connection to backend {id} failed: {reason}")]
    ConnectFailed { id: BackendId, reason: String },

    #[error("connection to backend {id} timed out after {millis}ms")]
    Timeout { id: BackendId, millis: u128 },

    #[error("backend {id} uses unsupported transport {transport:?}")]
    UnsupportedTransport {
        id: BackendId,
        transport: TransportKind,
    },

    #[error("connection pool is closed")]
    Closed,
}

impl PoolError {
    /// Whether the error happened before any network activity
    pub fn is_resolution(&self) -> bool {
        matches!(self, PoolError::HostNotFound(_) | PoolError::Registry(_))
    }
}

/// Builds one client for one descriptor.
///
/// Implementations perform the network handshake (if any) inside `connect`;
/// the pool bounds the whole call with its connect timeout.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    async fn connect(&self, descriptor: &BackendDescriptor) -> Result<Self::Client, PoolError>;
}

fn unix_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// One cached backend
struct PoolEntry<T> {
    cell: OnceCell<Result<ClientHandle<T>, PoolError>>,
    created_at: DateTime<Utc>,
    last_used: AtomicU64,
}

impl<T> PoolEntry<T> {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            created_at: Utc::now(),
            last_used: AtomicU64::new(unix_millis()),
        }
    }

    fn touch(&self) {
        self.last_used.store(unix_millis(), Ordering::SeqCst);
    }

    fn ready(&self) -> Option<&ClientHandle<T>> {
        match self.cell.get() {
            Some(Ok(handle)) => Some(handle),
            _ => None,
        }
    }

    fn failed(&self) -> bool {
        matches!(self.cell.get(), Some(Err(_)))
    }

    fn idle_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_used.load(Ordering::SeqCst))
    }
}

/// Per-entry information (for monitoring)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleInfo {
    pub backend_id: BackendId,
    pub ready: bool,
    pub created_at: String,
    pub last_used: String,
}

/// Pool statistics (for monitoring)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolStats {
    /// Entries in the map, ready or under construction
    pub total_entries: usize,
    /// Entries holding a live handle
    pub ready_entries: usize,
    /// Entries whose connection is still being built
    pub pending_entries: usize,
    pub has_fallback: bool,
    pub eviction: EvictionPolicy,
}

/// Per-backend client cache
pub struct ConnectionPool<C: Connector> {
    connector: C,
    registry: Arc<dyn HostRegistry>,
    entries: DashMap<BackendId, Arc<PoolEntry<C::Client>>>,
    /// Used for id 1 when the registry has no entry for it
    fallback: Option<ClientHandle<C::Client>>,
    config: ConnectionPoolConfig,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, registry: Arc<dyn HostRegistry>) -> Self {
        Self::with_config(connector, registry, ConnectionPoolConfig::default())
    }

    pub fn with_config(
        connector: C,
        registry: Arc<dyn HostRegistry>,
        config: ConnectionPoolConfig,
    ) -> Self {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        Self {
            connector,
            registry,
            entries: DashMap::new(),
            fallback: None,
            config,
            connect_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Install the preconfigured local client used for id 1
    pub fn with_fallback(mut self, client: C::Client) -> Self {
        self.fallback = Some(ClientHandle::new(BackendId::LOCAL, client));
        self
    }

    /// Override the construction bound (sub-second values are allowed here)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get the client for `id`, building it on first use.
    ///
    /// `None` means the local backend (id 1).
    pub async fn acquire(
        &self,
        id: Option<BackendId>,
    ) -> Result<ClientHandle<C::Client>, PoolError> {
        let id = id.unwrap_or(BackendId::LOCAL);

        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        // Fast path: shared lookup only, no network activity
        if let Some(handle) = self.lookup(id) {
            return Ok(handle);
        }

        for attempt in 1..=MAX_BUILD_ATTEMPTS {
            let generation = self.registry.generation();
            let descriptor = match self.registry.resolve(id).await {
                Ok(descriptor) => descriptor,
                Err(RegistryError::NotFound(_)) => {
                    if id == BackendId::LOCAL {
                        if let Some(fallback) = &self.fallback {
                            debug!("Backend 1 not registered, using local fallback client");
                            return Ok(fallback.clone());
                        }
                    }
                    return Err(PoolError::HostNotFound(id));
                }
                Err(e) => return Err(PoolError::Registry(e.to_string())),
            };

            let entry = self.slot(id);
            let outcome = entry.cell.get_or_init(|| self.construct(&descriptor)).await;

            match outcome {
                Ok(handle) => {
                    if !self.still_registered(id, &descriptor, generation).await {
                        // Removed or replaced while connecting: the handle
                        // must not outlive the descriptor it was built from
                        self.entries
                            .remove_if(&id, |_, current| Arc::ptr_eq(current, &entry));
                        debug!(
                            "Backend {} changed during connect (attempt {}), retrying",
                            id, attempt
                        );
                        continue;
                    }
                    entry.touch();
                    return Ok(handle.clone());
                }
                Err(e) => {
                    // Failures are never cached
                    self.entries
                        .remove_if(&id, |_, current| Arc::ptr_eq(current, &entry));
                    return Err(e.clone());
                }
            }
        }

        warn!("Backend {} kept changing while connecting, giving up", id);
        Err(PoolError::Registry(format!(
            "backend {} changed repeatedly while connecting",
            id
        )))
    }

    /// Whether `descriptor` is still what the registry holds for `id`
    async fn still_registered(
        &self,
        id: BackendId,
        descriptor: &Arc<BackendDescriptor>,
        generation: u64,
    ) -> bool {
        if self.registry.generation() == generation {
            return true;
        }
        match self.registry.resolve(id).await {
            Ok(current) => Arc::ptr_eq(&current, descriptor),
            Err(_) => false,
        }
    }

    /// Drop the pooled handle for `id`.
    ///
    /// Sessions that already acquired it keep using their clone; the
    /// underlying client is released when the last clone goes away.
    pub fn invalidate(&self, id: BackendId) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                if entry.ready().is_some() {
                    info!("Invalidated pooled client for backend {}", id);
                } else {
                    debug!("Invalidated pending entry for backend {}", id);
                }
                true
            }
            None => false,
        }
    }

    /// Close the pool: drop every handle and refuse further acquires
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.entries.len();
        self.entries.clear();
        info!("Connection pool closed, released {} entries", count);
    }

    /// Apply the eviction policy once. Returns the evicted ids.
    pub fn evict_idle(&self) -> Vec<BackendId> {
        let idle_millis = match self.config.eviction {
            EvictionPolicy::Never => return Vec::new(),
            EvictionPolicy::Idle { idle_secs } => idle_secs.saturating_mul(1000),
        };

        let now = unix_millis();
        let candidates: Vec<BackendId> = self
            .entries
            .iter()
            .filter(|e| e.value().ready().is_some() && e.value().idle_millis(now) >= idle_millis)
            .map(|e| *e.key())
            .collect();

        let mut evicted = Vec::new();
        for id in candidates {
            // Re-check under the shard lock; an acquire may have touched it
            let removed = self.entries.remove_if(&id, |_, entry| {
                entry.ready().is_some() && entry.idle_millis(now) >= idle_millis
            });
            if removed.is_some() {
                debug!("Evicted idle client for backend {}", id);
                evicted.push(id);
            }
        }
        evicted
    }

    /// Spawn the periodic reaper for `EvictionPolicy::Idle`.
    ///
    /// Returns `None` for `EvictionPolicy::Never`. The task holds a weak
    /// reference and stops once the pool is dropped or closed.
    pub fn spawn_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.config.eviction == EvictionPolicy::Never {
            return None;
        }

        let pool: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.reap_interval_secs.max(1));
        info!(
            "Starting idle reaper ({:?}, every {}s)",
            self.config.eviction,
            period.as_secs()
        );

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.is_closed() {
                    break;
                }
                let evicted = pool.evict_idle();
                if !evicted.is_empty() {
                    info!("Idle reaper evicted {} backend clients", evicted.len());
                }
            }
            debug!("Idle reaper stopped");
        }))
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        let mut ready_entries = 0;
        let mut pending_entries = 0;
        for entry in self.entries.iter() {
            if entry.value().ready().is_some() {
                ready_entries += 1;
            } else if !entry.value().failed() {
                pending_entries += 1;
            }
        }

        ConnectionPoolStats {
            total_entries: self.entries.len(),
            ready_entries,
            pending_entries,
            has_fallback: self.fallback.is_some(),
            eviction: self.config.eviction.clone(),
        }
    }

    pub fn handle_info(&self) -> Vec<HandleInfo> {
        let mut infos: Vec<HandleInfo> = self
            .entries
            .iter()
            .map(|e| {
                let entry = e.value();
                HandleInfo {
                    backend_id: *e.key(),
                    ready: entry.ready().is_some(),
                    created_at: entry.created_at.to_rfc3339(),
                    last_used: DateTime::from_timestamp_millis(
                        entry.last_used.load(Ordering::SeqCst) as i64,
                    )
                    .unwrap_or_default()
                    .to_rfc3339(),
                }
            })
            .collect();
        infos.sort_by_key(|i| i.backend_id);
        infos
    }

    fn lookup(&self, id: BackendId) -> Option<ClientHandle<C::Client>> {
        let entry = self.entries.get(&id)?;
        let handle = entry.ready()?.clone();
        entry.touch();
        Some(handle)
    }

    /// Get the entry for `id`, inserting an empty one (or replacing a failed
    /// one) under the shard's exclusive lock
    fn slot(&self, id: BackendId) -> Arc<PoolEntry<C::Client>> {
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().failed() {
                    occupied.insert(Arc::new(PoolEntry::new()));
                }
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => vacant.insert(Arc::new(PoolEntry::new())).value().clone(),
        }
    }

    async fn construct(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<ClientHandle<C::Client>, PoolError> {
        let id = descriptor.id;
        info!(
            "Connecting to backend {} ({:?} {})",
            id, descriptor.transport, descriptor.address
        );

        let client = tokio::time::timeout(self.connect_timeout, self.connector.connect(descriptor))
            .await
            .map_err(|_| PoolError::Timeout {
                id,
                millis: self.connect_timeout.as_millis(),
            })?
            .map_err(|e| {
                warn!("Connection to backend {} failed: {}", id, e);
                e
            })?;

        info!("Backend {} connected", id);
        Ok(ClientHandle::new(id, client))
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        debug!("Dropping connection pool with {} entries", self.entries.len());
    }
}
