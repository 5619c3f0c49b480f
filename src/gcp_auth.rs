//! OAuth2 access tokens for Google Cloud REST APIs.
//!
//! A service-account key is turned into an RS256-signed JWT, exchanged at the
//! token endpoint, and the resulting access token is cached until shortly
//! before it expires. For local runs a pre-minted token can be supplied via
//! `GCP_ACCESS_TOKEN` instead.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::{classify_status, classify_transport, ServiceError};

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Refresh this many seconds before the token actually expires.
const EXPIRY_MARGIN_SECS: u64 = 60;

#[derive(Clone)]
pub enum TokenSource {
    ServiceAccount(ServiceAccountTokens),
    Static(String),
}

impl TokenSource {
    /// Service-account key file if given, otherwise `GCP_ACCESS_TOKEN`.
    pub fn from_config(credentials_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = credentials_path {
            return Ok(Self::ServiceAccount(ServiceAccountTokens::from_key_file(path)?));
        }
        let token = std::env::var("GCP_ACCESS_TOKEN").context(
            "neither GOOGLE_APPLICATION_CREDENTIALS nor GCP_ACCESS_TOKEN is set",
        )?;
        info!("Using static GCP access token from GCP_ACCESS_TOKEN");
        Ok(Self::Static(token))
    }

    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String, ServiceError> {
        match self {
            Self::ServiceAccount(tokens) => tokens.access_token(client).await,
            Self::Static(token) => Ok(token.clone()),
        }
    }
}

#[derive(Clone)]
pub struct ServiceAccountTokens {
    key: ServiceAccountKey,
    token_cache: Arc<Mutex<Option<CachedToken>>>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: u64,
}

#[derive(Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

impl ServiceAccountTokens {
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let key_json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key: {path:?}"))?;
        let key: ServiceAccountKey = serde_json::from_str(&key_json)
            .with_context(|| format!("Failed to parse service account key: {path:?}"))?;
        // Fail at startup, not on the first request.
        jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("Invalid RSA private key in service account JSON")?;

        info!("Loaded service account {}", key.client_email);
        Ok(Self {
            key,
            token_cache: Arc::new(Mutex::new(None)),
        })
    }

    /// Get a valid OAuth2 access token, refreshing if expired.
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String, ServiceError> {
        {
            let cache = self.token_cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(ref cached) = *cache {
                if now_secs() < cached.expires_at.saturating_sub(EXPIRY_MARGIN_SECS) {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let token_uri = self.key.token_uri.as_deref().unwrap_or(TOKEN_URI);
        let now = now_secs();
        let claims = serde_json::json!({
            "iss": self.key.client_email,
            "scope": CLOUD_PLATFORM_SCOPE,
            "aud": token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| ServiceError::Misconfigured(format!("service account key: {e}")))?;
        let jwt = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| ServiceError::Misconfigured(format!("JWT encoding failed: {e}")))?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let response = client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(format!("token response: {e}")))?;

        debug!("Minted GCP access token, expires in {}s", token.expires_in);
        let access_token = token.access_token.clone();
        {
            let mut cache = self.token_cache.lock().unwrap_or_else(PoisonError::into_inner);
            *cache = Some(CachedToken {
                access_token: token.access_token,
                expires_at: now + token.expires_in,
            });
        }

        Ok(access_token)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_is_returned_verbatim() {
        let source = TokenSource::Static("ya29.test".into());
        let client = reqwest::Client::new();
        assert_eq!(source.access_token(&client).await.unwrap(), "ya29.test");
    }

    #[test]
    fn test_bad_key_file_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(
            &path,
            r#"{"client_email": "svc@demo.iam.gserviceaccount.com", "private_key": "not a pem"}"#,
        )
        .unwrap();
        assert!(ServiceAccountTokens::from_key_file(&path).is_err());
        assert!(ServiceAccountTokens::from_key_file(&dir.path().join("missing.json")).is_err());
    }
}
