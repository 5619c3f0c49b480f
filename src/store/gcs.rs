//! Google Cloud Storage artifact store (JSON API).

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{debug, info};

use super::ArtifactStore;
use crate::error::{classify_status, classify_transport, ServiceError};
use crate::gcp_auth::TokenSource;
use crate::schema::ArtifactId;

const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/b";
const OBJECT_BASE: &str = "https://storage.googleapis.com/storage/v1/b";
const OBJECT_PREFIX: &str = "artifacts";

pub struct GcsArtifactStore {
    client: reqwest::Client,
    tokens: TokenSource,
    bucket: String,
}

impl GcsArtifactStore {
    pub fn new(client: reqwest::Client, tokens: TokenSource, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        info!("GcsArtifactStore: using bucket {}", bucket);
        Self {
            client,
            tokens,
            bucket,
        }
    }

    fn object_name(id: &ArtifactId) -> String {
        format!("{OBJECT_PREFIX}/{id}")
    }

    /// Storage errors from GCS are retryable unless the request itself was wrong.
    fn storage_error(err: ServiceError) -> ServiceError {
        match err {
            ServiceError::RateLimited(m) | ServiceError::ServiceUnavailable(m) => {
                ServiceError::StorageUnavailable(m)
            }
            other => other,
        }
    }
}

#[async_trait]
impl ArtifactStore for GcsArtifactStore {
    fn name(&self) -> &str {
        "gcs"
    }

    async fn put(&self, bytes: Arc<[u8]>) -> Result<ArtifactId, ServiceError> {
        let id = ArtifactId::of(&bytes);
        let token = self.tokens.access_token(&self.client).await?;

        // ifGenerationMatch=0 only creates; an existing object answers 412.
        let response = self
            .client
            .post(format!("{UPLOAD_BASE}/{}/o", self.bucket))
            .query(&[
                ("uploadType", "media"),
                ("name", Self::object_name(&id).as_str()),
                ("ifGenerationMatch", "0"),
            ])
            .bearer_auth(token)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| Self::storage_error(classify_transport(&e)))?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            debug!("GcsArtifactStore: {} already present", id);
            return Ok(id);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::storage_error(classify_status(status, &body)));
        }

        debug!("GcsArtifactStore: stored {} ({} bytes)", id, bytes.len());
        Ok(id)
    }

    async fn get(&self, id: &ArtifactId) -> Result<Arc<[u8]>, ServiceError> {
        let token = self.tokens.access_token(&self.client).await?;
        let object = Self::object_name(id).replace('/', "%2F");

        let response = self
            .client
            .get(format!("{OBJECT_BASE}/{}/o/{object}", self.bucket))
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Self::storage_error(classify_transport(&e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::storage_error(classify_status(status, &body)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServiceError::StorageUnavailable(format!("read body: {e}")))?;
        Ok(Arc::from(bytes.to_vec()))
    }
}
