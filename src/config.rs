//! Pipeline configuration.
//!
//! Built once at startup from environment variables (after `.env` is loaded)
//! or from a JSON file, validated, and then shared immutably.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::schema::AudioEncoding;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub gcp: GcpConfig,
    pub storage: StorageConfig,
    pub ocr: OcrConfig,
    pub generation: GenerationConfig,
    pub speech: SpeechConfig,
    pub retry: StageRetryPolicies,
    pub limits: ConcurrencyLimits,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    pub project_id: Option<String>,
    pub region: String,
    /// Service-account key file. Falls back to `GCP_ACCESS_TOKEN` when unset.
    pub credentials_path: Option<PathBuf>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            region: "us-central1".to_string(),
            credentials_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Fs,
    Gcs,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub directory: PathBuf,
    pub bucket: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            directory: PathBuf::from("artifacts"),
            bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrBackend {
    /// Every document goes to Cloud Vision.
    Vision,
    /// PDFs with a text layer are read locally; everything else goes to Cloud Vision.
    Layered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub backend: OcrBackend,
    pub low_confidence_threshold: f32,
    /// Pages sent per Vision `files:annotate` call; the service accepts at most five.
    pub pages_per_request: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            backend: OcrBackend::Layered,
            low_confidence_threshold: 0.7,
            pages_per_request: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationBackend {
    Vertex,
    Openrouter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub backend: GenerationBackend,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_summary_words: u32,
    pub max_prompt_chars: usize,
    pub openrouter_api_key: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: GenerationBackend::Vertex,
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.2,
            max_output_tokens: 2048,
            max_summary_words: 250,
            max_prompt_chars: 150_000,
            openrouter_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub encoding: AudioEncoding,
    /// Preferred voice family tried before the service default, e.g. `Neural2-A`.
    pub preferred_voice_suffix: Option<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Mp3,
            preferred_voice_suffix: Some("Neural2-A".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetryPolicies {
    pub storage: RetryPolicy,
    pub ocr: RetryPolicy,
    pub generation: RetryPolicy,
    pub speech: RetryPolicy,
}

impl Default for StageRetryPolicies {
    fn default() -> Self {
        Self {
            storage: RetryPolicy {
                call_timeout_ms: 15_000,
                ..RetryPolicy::default()
            },
            ocr: RetryPolicy::default(),
            generation: RetryPolicy {
                call_timeout_ms: 60_000,
                deadline_ms: Some(180_000),
                ..RetryPolicy::default()
            },
            speech: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
    pub storage: usize,
    pub ocr: usize,
    pub generation: usize,
    pub speech: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            storage: 16,
            ocr: 8,
            generation: 4,
            speech: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub log_level: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            log_level: "info".to_string(),
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    /// Load from `DOC_INSIGHT_CONFIG` (JSON) if set, otherwise from individual
    /// environment variables. Validated either way.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var("DOC_INSIGHT_CONFIG") {
            Ok(path) => Self::from_json_file(Path::new(&path))?,
            Err(_) => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read every setting from the process environment, defaults elsewhere.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build from a key lookup (the environment in production, a map in tests).
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        config.gcp.project_id = env.string("GCP_PROJECT_ID");
        if let Some(region) = env.string("GCP_REGION") {
            config.gcp.region = region;
        }
        config.gcp.credentials_path = env.string("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from);

        if let Some(backend) = env.string("STORAGE_BACKEND") {
            config.storage.backend = match backend.as_str() {
                "fs" => StorageBackend::Fs,
                "gcs" => StorageBackend::Gcs,
                "memory" => StorageBackend::Memory,
                _ => return Err(invalid("STORAGE_BACKEND", &backend, "expected fs|gcs|memory")),
            };
        }
        if let Some(dir) = env.string("ARTIFACT_DIR") {
            config.storage.directory = PathBuf::from(dir);
        }
        config.storage.bucket = env.string("GCS_BUCKET_NAME");

        if let Some(backend) = env.string("OCR_BACKEND") {
            config.ocr.backend = match backend.as_str() {
                "vision" => OcrBackend::Vision,
                "layered" => OcrBackend::Layered,
                _ => return Err(invalid("OCR_BACKEND", &backend, "expected vision|layered")),
            };
        }
        env.parse_into("OCR_LOW_CONFIDENCE_THRESHOLD", &mut config.ocr.low_confidence_threshold)?;
        env.parse_into("OCR_PAGES_PER_REQUEST", &mut config.ocr.pages_per_request)?;

        if let Some(backend) = env.string("GENERATION_BACKEND") {
            config.generation.backend = match backend.as_str() {
                "vertex" => GenerationBackend::Vertex,
                "openrouter" => GenerationBackend::Openrouter,
                _ => {
                    return Err(invalid(
                        "GENERATION_BACKEND",
                        &backend,
                        "expected vertex|openrouter",
                    ))
                }
            };
        }
        if let Some(model) = env.string("GEMINI_MODEL_NAME") {
            config.generation.model = model;
        }
        env.parse_into("GENERATION_TEMPERATURE", &mut config.generation.temperature)?;
        env.parse_into("GENERATION_MAX_OUTPUT_TOKENS", &mut config.generation.max_output_tokens)?;
        env.parse_into("MAX_SUMMARY_WORDS", &mut config.generation.max_summary_words)?;
        env.parse_into("MAX_PROMPT_CHARS", &mut config.generation.max_prompt_chars)?;
        config.generation.openrouter_api_key = env.string("OPENROUTER_API_KEY");

        if let Some(encoding) = env.string("SPEECH_ENCODING") {
            config.speech.encoding = match encoding.to_ascii_lowercase().as_str() {
                "mp3" => AudioEncoding::Mp3,
                "linear16" | "wav" => AudioEncoding::Linear16,
                _ => return Err(invalid("SPEECH_ENCODING", &encoding, "expected mp3|linear16")),
            };
        }
        if let Some(suffix) = env.string("SPEECH_PREFERRED_VOICE") {
            config.speech.preferred_voice_suffix = (suffix != "none").then_some(suffix);
        }

        env.retry_policy("STORAGE", &mut config.retry.storage)?;
        env.retry_policy("OCR", &mut config.retry.ocr)?;
        env.retry_policy("GENERATION", &mut config.retry.generation)?;
        env.retry_policy("SPEECH", &mut config.retry.speech)?;

        env.parse_into("STORAGE_CONCURRENCY", &mut config.limits.storage)?;
        env.parse_into("OCR_CONCURRENCY", &mut config.limits.ocr)?;
        env.parse_into("GENERATION_CONCURRENCY", &mut config.limits.generation)?;
        env.parse_into("SPEECH_CONCURRENCY", &mut config.limits.speech)?;

        if let Some(addr) = env.string("BIND_ADDR") {
            config.server.bind_addr = addr;
        }
        if let Some(level) = env.string("LOG_LEVEL") {
            config.server.log_level = level.to_ascii_lowercase();
        }
        env.parse_into("MAX_UPLOAD_BYTES", &mut config.server.max_upload_bytes)?;

        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.ocr.low_confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "ocr.low_confidence_threshold",
                &threshold.to_string(),
                "must be within 0.0..=1.0",
            ));
        }
        if !(1..=5).contains(&self.ocr.pages_per_request) {
            return Err(invalid(
                "ocr.pages_per_request",
                &self.ocr.pages_per_request.to_string(),
                "must be within 1..=5",
            ));
        }

        for (stage, policy) in [
            ("storage", &self.retry.storage),
            ("ocr", &self.retry.ocr),
            ("generation", &self.retry.generation),
            ("speech", &self.retry.speech),
        ] {
            if policy.max_attempts == 0 {
                return Err(invalid(&format!("retry.{stage}.max_attempts"), "0", "must be at least 1"));
            }
            if policy.backoff_factor < 1.0 {
                return Err(invalid(
                    &format!("retry.{stage}.backoff_factor"),
                    &policy.backoff_factor.to_string(),
                    "must be >= 1.0",
                ));
            }
            if policy.call_timeout_ms == 0 {
                return Err(invalid(&format!("retry.{stage}.call_timeout_ms"), "0", "must be positive"));
            }
            if policy.base_delay_ms > policy.max_delay_ms {
                return Err(invalid(
                    &format!("retry.{stage}.base_delay_ms"),
                    &policy.base_delay_ms.to_string(),
                    "must not exceed max_delay_ms",
                ));
            }
        }

        for (service, limit) in [
            ("storage", self.limits.storage),
            ("ocr", self.limits.ocr),
            ("generation", self.limits.generation),
            ("speech", self.limits.speech),
        ] {
            if limit == 0 {
                return Err(invalid(&format!("limits.{service}"), "0", "must be at least 1"));
            }
        }

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(invalid(
                "generation.temperature",
                &self.generation.temperature.to_string(),
                "must be within 0.0..=2.0",
            ));
        }
        if self.generation.max_output_tokens == 0 || self.generation.max_prompt_chars == 0 {
            return Err(invalid("generation", "0", "token and prompt limits must be positive"));
        }

        let uses_google = self.storage.backend == StorageBackend::Gcs
            || self.generation.backend == GenerationBackend::Vertex;
        if uses_google && self.gcp.project_id.is_none() {
            return Err(ConfigError::Missing("GCP_PROJECT_ID"));
        }
        if self.storage.backend == StorageBackend::Gcs && self.storage.bucket.is_none() {
            return Err(ConfigError::Missing("GCS_BUCKET_NAME"));
        }
        if self.generation.backend == GenerationBackend::Openrouter
            && self.generation.openrouter_api_key.is_none()
        {
            return Err(ConfigError::Missing("OPENROUTER_API_KEY"));
        }

        Ok(())
    }

    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> String {
        let level = &self.server.log_level;
        format!("doc_insight={level},tower_http={level}")
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

struct Lookup<L>(L);

impl<L> Lookup<L>
where
    L: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_into<T>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.string(key) {
            *slot = raw
                .parse()
                .map_err(|e: T::Err| invalid(key, &raw, &e.to_string()))?;
        }
        Ok(())
    }

    fn retry_policy(&self, prefix: &str, policy: &mut RetryPolicy) -> Result<(), ConfigError> {
        self.parse_into(&format!("{prefix}_MAX_ATTEMPTS"), &mut policy.max_attempts)?;
        self.parse_into(&format!("{prefix}_BASE_DELAY_MS"), &mut policy.base_delay_ms)?;
        self.parse_into(&format!("{prefix}_MAX_DELAY_MS"), &mut policy.max_delay_ms)?;
        self.parse_into(&format!("{prefix}_BACKOFF_FACTOR"), &mut policy.backoff_factor)?;
        self.parse_into(&format!("{prefix}_JITTER"), &mut policy.jitter)?;
        self.parse_into(&format!("{prefix}_CALL_TIMEOUT_MS"), &mut policy.call_timeout_ms)?;
        if let Some(raw) = self.string(&format!("{prefix}_DEADLINE_MS")) {
            policy.deadline_ms = match raw.as_str() {
                "none" | "0" => None,
                _ => Some(raw.parse().map_err(|e: std::num::ParseIntError| {
                    invalid(&format!("{prefix}_DEADLINE_MS"), &raw, &e.to_string())
                })?),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_need_project_for_vertex() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("GCP_PROJECT_ID"))
        ));

        let config = PipelineConfig::from_lookup(lookup(&[("GCP_PROJECT_ID", "demo")])).unwrap();
        config.validate().unwrap();
        assert_eq!(config.generation.model, "gemini-2.5-flash");
        assert_eq!(config.gcp.region, "us-central1");
    }

    #[test]
    fn test_retry_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("GCP_PROJECT_ID", "demo"),
            ("OCR_MAX_ATTEMPTS", "5"),
            ("GENERATION_DEADLINE_MS", "none"),
            ("SPEECH_JITTER", "false"),
        ]))
        .unwrap();
        assert_eq!(config.retry.ocr.max_attempts, 5);
        assert_eq!(config.retry.generation.deadline_ms, None);
        assert!(!config.retry.speech.jitter);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = PipelineConfig::from_lookup(lookup(&[("OCR_MAX_ATTEMPTS", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = PipelineConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "s3")])).unwrap_err();
        assert!(err.to_string().contains("STORAGE_BACKEND"));

        let config = PipelineConfig::from_lookup(lookup(&[
            ("GCP_PROJECT_ID", "demo"),
            ("OCR_LOW_CONFIDENCE_THRESHOLD", "1.5"),
        ]))
        .unwrap();
        assert!(config.validate().is_err());

        let config = PipelineConfig::from_lookup(lookup(&[
            ("GCP_PROJECT_ID", "demo"),
            ("GENERATION_CONCURRENCY", "0"),
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_limit_and_page_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[("GCP_PROJECT_ID", "demo")])).unwrap();
        assert_eq!(config.limits.storage, 16);
        assert_eq!(config.limits.ocr, 8);
        assert_eq!(config.limits.generation, 4);
        assert_eq!(config.limits.speech, 4);
        assert_eq!(config.ocr.pages_per_request, 5);

        let config = PipelineConfig::from_lookup(lookup(&[
            ("GCP_PROJECT_ID", "demo"),
            ("OCR_CONCURRENCY", "2"),
            ("OCR_PAGES_PER_REQUEST", "6"),
        ]))
        .unwrap();
        assert_eq!(config.limits.ocr, 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gcs_requires_bucket() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("GCP_PROJECT_ID", "demo"),
            ("STORAGE_BACKEND", "gcs"),
        ]))
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("GCS_BUCKET_NAME"))
        ));
    }

    #[test]
    fn test_json_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"gcp": {"project_id": "demo"}, "retry": {"ocr": {"max_attempts": 2}}}"#,
        )
        .unwrap();

        let config = PipelineConfig::from_json_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.retry.ocr.max_attempts, 2);
        assert_eq!(config.retry.ocr.base_delay_ms, 500);
        assert_eq!(config.limits.generation, 4);
    }
}
