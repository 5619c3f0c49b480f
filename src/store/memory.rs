//! In-memory artifact store for tests and ephemeral runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::ArtifactStore;
use crate::error::ServiceError;
use crate::schema::ArtifactId;

/// Content-addressed map of artifact bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    inner: Arc<RwLock<HashMap<ArtifactId, Arc<[u8]>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, bytes: Arc<[u8]>) -> Result<ArtifactId, ServiceError> {
        let id = ArtifactId::of(&bytes);
        let size = bytes.len();
        let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if store.contains_key(&id) {
            tracing::debug!("MemoryArtifactStore: '{}' already present", id);
        } else {
            store.insert(id.clone(), bytes);
            tracing::debug!("MemoryArtifactStore: stored '{}' ({} bytes)", id, size);
        }
        Ok(id)
    }

    async fn get(&self, id: &ArtifactId) -> Result<Arc<[u8]>, ServiceError> {
        let store = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        store
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }
}
