//! Local-filesystem artifact store.
//!
//! Layout: `<root>/<first two hex chars>/<full id>`. Writes go to a temp file
//! in the same directory and are renamed into place, so a reader never sees
//! a partial artifact.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::ArtifactStore;
use crate::error::ServiceError;
use crate::schema::ArtifactId;

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            anyhow::anyhow!("Failed to create artifact directory {:?}: {}", root, e)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &ArtifactId) -> PathBuf {
        let id = id.as_str();
        self.root.join(&id[..2]).join(id)
    }
}

fn storage_error(context: &str, err: std::io::Error) -> ServiceError {
    ServiceError::StorageUnavailable(format!("{context}: {err}"))
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn name(&self) -> &str {
        "fs"
    }

    async fn put(&self, bytes: Arc<[u8]>) -> Result<ArtifactId, ServiceError> {
        let id = ArtifactId::of(&bytes);
        let path = self.path_for(&id);

        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| storage_error("stat", e))?
        {
            debug!("FsArtifactStore: {} already present", id);
            return Ok(id);
        }

        let dir = path
            .parent()
            .ok_or_else(|| ServiceError::StorageUnavailable(format!("no parent for {path:?}")))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| storage_error("create dir", e))?;

        let tmp = dir.join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes[..])
            .await
            .map_err(|e| storage_error("write", e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(storage_error("rename", e));
        }

        debug!("FsArtifactStore: stored {} ({} bytes)", id, bytes.len());
        Ok(id)
    }

    async fn get(&self, id: &ArtifactId) -> Result<Arc<[u8]>, ServiceError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Arc::from(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ServiceError::NotFound(id.to_string())),
            Err(e) => Err(storage_error("read", e)),
        }
    }
}
