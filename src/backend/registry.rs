//! Backend registry
//!
//! The registry is the storage-layer collaborator: `resolve(id)` either yields a
//! descriptor or fails with "not found". Lookups are never cached by callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::descriptor::{BackendDescriptor, BackendId};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("host not found: {0}")]
    NotFound(BackendId),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Resolves backend ids to descriptors
#[async_trait]
pub trait HostRegistry: Send + Sync + 'static {
    async fn resolve(&self, id: BackendId) -> Result<Arc<BackendDescriptor>, RegistryError>;

    /// Counter bumped by every mutation. Registries that never change keep
    /// the default.
    fn generation(&self) -> u64 {
        0
    }
}

/// In-memory registry, seeded from configuration and mutated by host management
#[derive(Default)]
pub struct StaticRegistry {
    entries: RwLock<HashMap<BackendId, Arc<BackendDescriptor>>>,
    generation: AtomicU64,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = BackendDescriptor>) -> Self {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.upsert(descriptor);
        }
        registry
    }

    /// Insert or replace a descriptor. Returns the previous one, if any.
    pub fn upsert(&self, descriptor: BackendDescriptor) -> Option<Arc<BackendDescriptor>> {
        debug!("Registry upsert for backend {}", descriptor.id);
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        entries.insert(descriptor.id, Arc::new(descriptor))
    }

    pub fn remove(&self, id: BackendId) -> Option<Arc<BackendDescriptor>> {
        let mut entries = self.entries.write();
        let removed = entries.remove(&id);
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<_> = self.entries.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl HostRegistry for StaticRegistry {
    async fn resolve(&self, id: BackendId) -> Result<Arc<BackendDescriptor>, RegistryError> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
