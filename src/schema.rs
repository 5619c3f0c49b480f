//! Pipeline data model.
//!
//! Records produced by each stage and the caller-facing [`PipelineResult`].
//! Raw document bytes live only in [`Document`]; every later record refers
//! to the document by [`DocumentId`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::language::Language;
use crate::pipeline::state::{PipelineState, Stage};

// ============================================================================
// Identity
// ============================================================================

/// Content address: lowercase hex SHA-256 of the stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Accept an id from an untrusted source (URL path, object name).
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Documents are artifacts; the id is the hash of the uploaded bytes.
pub type DocumentId = ArtifactId;

// ============================================================================
// Document
// ============================================================================

/// An uploaded document. Immutable once created.
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    bytes: Arc<[u8]>,
    mime_type: String,
    uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(bytes: impl Into<Arc<[u8]>>, mime_type: impl Into<String>) -> Self {
        let bytes = bytes.into();
        Self {
            id: ArtifactId::of(&bytes),
            bytes,
            mime_type: mime_type.into().trim().to_ascii_lowercase(),
            uploaded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn uploaded_at(&self) -> DateTime<Utc> {
        self.uploaded_at
    }
}

/// What the storage stage reports once the upload is durable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDocument {
    pub document_id: DocumentId,
    pub mime_type: String,
    pub size_bytes: usize,
    pub stored_at: DateTime<Utc>,
}

// ============================================================================
// Extraction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Text read from an embedded PDF text layer; no OCR call.
    PdfTextLayer,
    /// Cloud OCR (document text detection).
    VisionOcr,
}

/// One layout block with its recognition confidence (0.0-1.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub page: u32,
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub document_id: DocumentId,
    pub extracted_text: String,
    pub blocks: Vec<TextBlock>,
    pub page_count: u32,
    /// Text-length-weighted mean of block confidences.
    pub confidence: f32,
    pub low_confidence: bool,
    pub method: ExtractionMethod,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    pub fn is_blank(&self) -> bool {
        self.extracted_text.trim().is_empty()
    }
}

// ============================================================================
// Analysis
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionAction {
    Summarize,
    Simplify,
}

impl InstructionAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "summarize" | "summarise" | "summary" => Some(Self::Summarize),
            "simplify" | "explain" => Some(Self::Simplify),
            _ => None,
        }
    }
}

/// Which instruction template to use, plus the regional context it is
/// rendered with. Both change the prompt, so both are part of the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstructionVariant {
    pub action: InstructionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl InstructionVariant {
    pub fn new(action: InstructionAction) -> Self {
        Self {
            action,
            country: None,
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        let country = country.into();
        let country = country.trim();
        self.country = (!country.is_empty()).then(|| country.to_string());
        self
    }
}

impl fmt::Display for InstructionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            InstructionAction::Summarize => "summarize",
            InstructionAction::Simplify => "simplify",
        };
        match &self.country {
            Some(country) => write!(f, "{action}[{country}]"),
            None => f.write_str(action),
        }
    }
}

/// Input to the generator. Built by the prompt builder, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub document_id: DocumentId,
    pub extracted_text: String,
    pub target_language: Language,
    pub instruction_variant: InstructionVariant,
    pub system_instruction: String,
    pub user_prompt: String,
}

impl AnalysisRequest {
    pub fn key(&self) -> AnalysisKey {
        AnalysisKey {
            document_id: self.document_id.clone(),
            target_language: self.target_language.clone(),
            instruction_variant: self.instruction_variant.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AnalysisKey {
    pub document_id: DocumentId,
    pub target_language: Language,
    pub instruction_variant: InstructionVariant,
}

impl fmt::Display for AnalysisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            &self.document_id.as_str()[..12.min(self.document_id.as_str().len())],
            self.target_language,
            self.instruction_variant
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub document_id: DocumentId,
    pub target_language: Language,
    pub instruction_variant: InstructionVariant,
    pub generated_text: String,
    pub model_identifier: String,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn key(&self) -> AnalysisKey {
        AnalysisKey {
            document_id: self.document_id.clone(),
            target_language: self.target_language.clone(),
            instruction_variant: self.instruction_variant.clone(),
        }
    }
}

// ============================================================================
// Audio
// ============================================================================

/// Voice as requested by the caller. `Default` lets the renderer choose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceSelection {
    Default,
    Named(String),
}

impl VoiceSelection {
    pub fn from_option(voice: Option<String>) -> Self {
        match voice.map(|v| v.trim().to_string()) {
            Some(v) if !v.is_empty() => Self::Named(v),
            _ => Self::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AudioKey {
    pub analysis: AnalysisKey,
    pub voice: VoiceSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    Mp3,
    Linear16,
}

impl AudioEncoding {
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Linear16 => "audio/wav",
        }
    }

    pub fn api_name(self) -> &'static str {
        match self {
            Self::Mp3 => "MP3",
            Self::Linear16 => "LINEAR16",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioArtifact {
    pub analysis_key: AnalysisKey,
    /// Where the audio bytes were persisted.
    pub artifact_id: ArtifactId,
    #[serde(skip)]
    pub audio: Arc<[u8]>,
    pub size_bytes: usize,
    pub encoding: AudioEncoding,
    /// Voice actually used, which may differ from the requested one after fallback.
    pub voice: String,
    pub language_code: String,
    pub duration_ms: u64,
}

// ============================================================================
// Pipeline result
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Served from an existing cache entry.
    Hit,
    /// Attached to another caller's in-flight computation.
    Joined,
    /// Computed by this call.
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    EmptyInput,
    NotRequested,
    UpstreamFailed { stage: Stage },
    UpstreamSkipped { stage: Stage },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    UnsupportedFormat { detail: String },
    ContentFiltered { detail: String },
    UnsupportedVoice { detail: String },
    /// Any other non-retryable rejection.
    Rejected { detail: String },
    RetriesExhausted { attempts: u32, last_error: String },
    DeadlineExceeded { elapsed_ms: u64, attempts: u32 },
    /// A defect inside the pipeline itself (panicked task, closed limiter).
    Internal { detail: String },
}

impl FailureReason {
    /// Generation failure in the sense of an exhausted retry/time budget.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted { .. } | Self::DeadlineExceeded { .. }
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFormat { detail } => write!(f, "unsupported format: {detail}"),
            Self::ContentFiltered { detail } => write!(f, "content filtered: {detail}"),
            Self::UnsupportedVoice { detail } => write!(f, "unsupported voice: {detail}"),
            Self::Rejected { detail } => write!(f, "rejected: {detail}"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "retries exhausted after {attempts} attempts: {last_error}"),
            Self::DeadlineExceeded {
                elapsed_ms,
                attempts,
            } => write!(f, "deadline exceeded after {elapsed_ms}ms ({attempts} attempts)"),
            Self::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded { source: CacheSource },
    Skipped { reason: SkipReason },
    Failed { reason: FailureReason },
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Status and (when available) output for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome<T> {
    #[serde(flatten)]
    pub status: StageStatus,
    pub output: Option<Arc<T>>,
    pub latency_ms: u64,
}

impl<T> StageOutcome<T> {
    pub fn succeeded(output: Arc<T>, source: CacheSource, latency_ms: u64) -> Self {
        Self {
            status: StageStatus::Succeeded { source },
            output: Some(output),
            latency_ms,
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            status: StageStatus::Skipped { reason },
            output: None,
            latency_ms: 0,
        }
    }

    pub fn failed(reason: FailureReason, latency_ms: u64) -> Self {
        Self {
            status: StageStatus::Failed { reason },
            output: None,
            latency_ms,
        }
    }

    pub fn output(&self) -> Option<&T> {
        self.output.as_deref()
    }
}

/// Caller-facing aggregate for one `process` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub request_id: Uuid,
    pub document_id: DocumentId,
    pub storage: StageOutcome<StoredDocument>,
    pub extraction: StageOutcome<ExtractionResult>,
    pub analysis: StageOutcome<AnalysisResult>,
    pub audio: StageOutcome<AudioArtifact>,
    /// Mirrors `extraction.low_confidence` so callers can warn without digging.
    pub low_confidence: bool,
    pub state: PipelineState,
    pub transitions: Vec<PipelineState>,
    pub total_latency_ms: u64,
}

impl PipelineResult {
    pub fn is_complete(&self) -> bool {
        matches!(self.state, PipelineState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_addressing() {
        let a = Document::new(b"statement-1".to_vec(), "image/png");
        let b = Document::new(b"statement-1".to_vec(), "image/png");
        let c = Document::new(b"statement-2".to_vec(), "image/png");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().as_str().len(), 64);
    }

    #[test]
    fn test_artifact_id_parse() {
        let id = ArtifactId::of(b"x");
        assert_eq!(ArtifactId::parse(id.as_str()), Some(id));
        assert_eq!(ArtifactId::parse("../etc/passwd"), None);
        assert_eq!(ArtifactId::parse(&"A".repeat(64)), None);
    }

    #[test]
    fn test_variant_country_is_part_of_identity() {
        let plain = InstructionVariant::new(InstructionAction::Summarize);
        let india = plain.clone().with_country("India");
        let blank = plain.clone().with_country("  ");
        assert_ne!(plain, india);
        assert_eq!(plain, blank);
        assert_eq!(india.to_string(), "summarize[India]");
    }

    #[test]
    fn test_voice_selection() {
        assert_eq!(VoiceSelection::from_option(None), VoiceSelection::Default);
        assert_eq!(
            VoiceSelection::from_option(Some(" ".into())),
            VoiceSelection::Default
        );
        assert_eq!(
            VoiceSelection::from_option(Some("hi-IN-Neural2-B".into())),
            VoiceSelection::Named("hi-IN-Neural2-B".into())
        );
    }

    #[test]
    fn test_stage_outcome_serializes_flat() {
        let outcome: StageOutcome<StoredDocument> =
            StageOutcome::skipped(SkipReason::EmptyInput);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"]["kind"], "empty_input");
        assert!(json["output"].is_null());
    }
}
