use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::backend::BackendId;

/// Shared reference to a pooled client.
///
/// Cloning is cheap. The underlying client is released once the pool and
/// every session holding a clone have dropped theirs.
pub struct ClientHandle<T> {
    backend_id: BackendId,
    client: Arc<T>,
    created_at: DateTime<Utc>,
}

impl<T> ClientHandle<T> {
    pub fn new(backend_id: BackendId, client: T) -> Self {
        Self {
            backend_id,
            client: Arc::new(client),
            created_at: Utc::now(),
        }
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn client(&self) -> &Arc<T> {
        &self.client
    }

    /// Whether both handles point at the same client instance
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.client, &b.client)
    }
}

impl<T> Clone for ClientHandle<T> {
    fn clone(&self) -> Self {
        Self {
            backend_id: self.backend_id,
            client: self.client.clone(),
            created_at: self.created_at,
        }
    }
}

impl<T> Deref for ClientHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.client
    }
}

impl<T> fmt::Debug for ClientHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("backend_id", &self.backend_id)
            .field("created_at", &self.created_at)
            .field("refs", &Arc::strong_count(&self.client))
            .finish()
    }
}
