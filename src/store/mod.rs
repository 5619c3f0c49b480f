//! Content-addressed artifact storage.
//!
//! Uploaded documents and rendered audio are stored under the SHA-256 of
//! their bytes, so `put` is idempotent and duplicate uploads collapse.

pub mod fs;
pub mod gcs;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::schema::ArtifactId;

pub use fs::FsArtifactStore;
pub use gcs::GcsArtifactStore;
pub use memory::MemoryArtifactStore;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store `bytes` and return their content address. Storing the same bytes
    /// again returns the same id without writing a second copy.
    async fn put(&self, bytes: Arc<[u8]>) -> Result<ArtifactId, ServiceError>;

    /// Fetch bytes by id. Unknown ids yield [`ServiceError::NotFound`].
    async fn get(&self, id: &ArtifactId) -> Result<Arc<[u8]>, ServiceError>;
}
