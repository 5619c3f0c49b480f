//! Pipeline orchestrator.
//!
//! Drives one document through storage, extraction, analysis and (optionally)
//! speech. Every stage goes through its per-key [`SingleFlight`] cache, and
//! every external call goes through [`retry::run`] under the owning service's
//! concurrency limiter. `process` never fails as a whole: each stage reports
//! its own status and later stages are skipped once one fails.

pub mod state;

use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::SingleFlight;
use crate::config::{
    ConcurrencyLimits, GenerationBackend, OcrBackend, PipelineConfig, StageRetryPolicies,
    StorageBackend,
};
use crate::error::ServiceError;
use crate::gcp_auth::TokenSource;
use crate::insight::{InsightGenerator, OpenRouterGenerator, VertexGenerator};
use crate::language::Language;
use crate::ocr::{DocumentFormat, LayeredOcr, OcrExtractor, VisionOcr};
use crate::prompt::{PromptBuilder, PromptError};
use crate::retry;
use crate::schema::{
    AnalysisKey, AnalysisRequest, AnalysisResult, ArtifactId, AudioArtifact, AudioEncoding,
    AudioKey, CacheSource, Document, DocumentId, ExtractionResult, FailureReason,
    InstructionVariant, PipelineResult, SkipReason, StageOutcome, StageStatus, StoredDocument,
    VoiceSelection,
};
use crate::speech::{GoogleTts, SpeechRenderer};
use crate::store::{ArtifactStore, FsArtifactStore, GcsArtifactStore, MemoryArtifactStore};

use state::{PipelineEvent, PipelineState, Stage, StateMachine};

/// One invocation of the pipeline.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub target_language: Language,
    pub instruction_variant: InstructionVariant,
    pub want_audio: bool,
    pub voice: Option<String>,
}

/// The external services the orchestrator drives.
#[derive(Clone)]
pub struct Adapters {
    pub store: Arc<dyn ArtifactStore>,
    pub ocr: Arc<dyn OcrExtractor>,
    pub generator: Arc<dyn InsightGenerator>,
    pub speech: Arc<dyn SpeechRenderer>,
}

impl Adapters {
    /// Build the configured backends.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("doc-insight/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let tokens = TokenSource::from_config(config.gcp.credentials_path.as_deref())?;
        let project_id = config.gcp.project_id.clone();

        let store: Arc<dyn ArtifactStore> = match config.storage.backend {
            StorageBackend::Fs => Arc::new(FsArtifactStore::open(config.storage.directory.clone()).await?),
            StorageBackend::Gcs => {
                let bucket = config
                    .storage
                    .bucket
                    .clone()
                    .context("GCS_BUCKET_NAME is required for the gcs storage backend")?;
                Arc::new(GcsArtifactStore::new(client.clone(), tokens.clone(), bucket))
            }
            StorageBackend::Memory => Arc::new(MemoryArtifactStore::new()),
        };

        let vision: Arc<dyn OcrExtractor> = Arc::new(VisionOcr::new(
            client.clone(),
            tokens.clone(),
            project_id.clone(),
            config.ocr.pages_per_request,
        ));
        let ocr: Arc<dyn OcrExtractor> = match config.ocr.backend {
            OcrBackend::Vision => vision,
            OcrBackend::Layered => Arc::new(LayeredOcr::new(vision)),
        };

        let generation = &config.generation;
        let generator: Arc<dyn InsightGenerator> = match generation.backend {
            GenerationBackend::Vertex => {
                let project = project_id
                    .as_deref()
                    .context("GCP_PROJECT_ID is required for the vertex backend")?;
                Arc::new(
                    VertexGenerator::new(
                        client.clone(),
                        tokens.clone(),
                        project,
                        &config.gcp.region,
                        &generation.model,
                    )
                    .with_sampling(generation.temperature, generation.max_output_tokens),
                )
            }
            GenerationBackend::Openrouter => {
                let api_key = generation
                    .openrouter_api_key
                    .clone()
                    .context("OPENROUTER_API_KEY is required for the openrouter backend")?;
                Arc::new(
                    OpenRouterGenerator::new(client.clone(), api_key, &generation.model)
                        .with_sampling(generation.temperature, generation.max_output_tokens),
                )
            }
        };

        let speech: Arc<dyn SpeechRenderer> = Arc::new(GoogleTts::new(
            client,
            tokens,
            project_id,
            config.speech.preferred_voice_suffix.clone(),
        ));

        info!(
            "Adapters ready: store={}, ocr={}, model={}, speech={}",
            store.name(),
            ocr.name(),
            generator.model_id(),
            speech.name()
        );
        Ok(Self {
            store,
            ocr,
            generator,
            speech,
        })
    }
}

/// One semaphore per external service, shared by every request.
#[derive(Clone)]
struct ServiceLimits {
    storage: Arc<Semaphore>,
    ocr: Arc<Semaphore>,
    generation: Arc<Semaphore>,
    speech: Arc<Semaphore>,
}

impl ServiceLimits {
    fn new(limits: &ConcurrencyLimits) -> Self {
        Self {
            storage: Arc::new(Semaphore::new(limits.storage)),
            ocr: Arc::new(Semaphore::new(limits.ocr)),
            generation: Arc::new(Semaphore::new(limits.generation)),
            speech: Arc::new(Semaphore::new(limits.speech)),
        }
    }
}

pub struct Orchestrator {
    adapters: Adapters,
    prompts: PromptBuilder,
    retry: StageRetryPolicies,
    limits: ServiceLimits,
    low_confidence_threshold: f32,
    encoding: AudioEncoding,
    documents: SingleFlight<DocumentId, StoredDocument>,
    extractions: SingleFlight<DocumentId, ExtractionResult>,
    analyses: SingleFlight<AnalysisKey, AnalysisResult>,
    audio: SingleFlight<AudioKey, AudioArtifact>,
}

impl Orchestrator {
    pub fn new(adapters: Adapters, config: &PipelineConfig) -> Self {
        Self {
            adapters,
            prompts: PromptBuilder::new(
                config.generation.max_summary_words,
                config.generation.max_prompt_chars,
            ),
            retry: config.retry.clone(),
            limits: ServiceLimits::new(&config.limits),
            low_confidence_threshold: config.ocr.low_confidence_threshold,
            encoding: config.speech.encoding,
            documents: SingleFlight::new("documents"),
            extractions: SingleFlight::new("extractions"),
            analyses: SingleFlight::new("analyses"),
            audio: SingleFlight::new("audio"),
        }
    }

    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let adapters = Adapters::from_config(config).await?;
        Ok(Self::new(adapters, config))
    }

    /// Fetch a stored artifact (uploaded document or rendered audio).
    pub async fn artifact(&self, id: &ArtifactId) -> Result<Arc<[u8]>, ServiceError> {
        self.adapters.store.get(id).await
    }

    pub async fn process(&self, request: ProcessRequest) -> PipelineResult {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let document = Arc::new(Document::new(request.bytes, request.mime_type));
        let document_id = document.id().clone();
        let mut machine = StateMachine::new();
        let mut blocked: Option<SkipReason> = None;

        info!(
            %request_id,
            document = %document_id,
            language = %request.target_language,
            variant = %request.instruction_variant,
            want_audio = request.want_audio,
            "Processing document"
        );

        let storage = timed(self.store_document(&document)).await;
        settle(&mut machine, Stage::Storage, &storage.status, PipelineEvent::Stored, &mut blocked);

        let extraction = match &blocked {
            Some(reason) => StageOutcome::skipped(reason.clone()),
            None => {
                // The declared mime belongs to this request, not to the cached
                // extraction, so it is checked outside the flight.
                let outcome = match DocumentFormat::detect(document.bytes(), document.mime_type()) {
                    Ok(format) => timed(self.extract(&document, format)).await,
                    Err(err) => {
                        warn!(document = %document_id, error = %err, "Rejected upload format");
                        StageOutcome::failed(retry::permanent_reason(err), 0)
                    }
                };
                settle(
                    &mut machine,
                    Stage::Extraction,
                    &outcome.status,
                    PipelineEvent::Extracted,
                    &mut blocked,
                );
                outcome
            }
        };
        drop(document);
        let low_confidence = extraction.output().is_some_and(|e| e.low_confidence);

        let upstream = blocked.clone();
        let analysis = match (upstream, &extraction.output) {
            (None, Some(extracted)) => match self.prompts.build(
                &extracted.extracted_text,
                &request.target_language,
                &request.instruction_variant,
                &document_id,
            ) {
                Ok(analysis_request) => {
                    let outcome = timed(self.analyze(analysis_request)).await;
                    settle(
                        &mut machine,
                        Stage::Analysis,
                        &outcome.status,
                        PipelineEvent::Analyzed,
                        &mut blocked,
                    );
                    outcome
                }
                Err(PromptError::EmptyInput) => {
                    info!(document = %document_id, "No text extracted, skipping analysis");
                    advance(&mut machine, PipelineEvent::AnalysisSkipped);
                    blocked = Some(SkipReason::UpstreamSkipped {
                        stage: Stage::Analysis,
                    });
                    StageOutcome::skipped(SkipReason::EmptyInput)
                }
            },
            (upstream, _) => StageOutcome::skipped(upstream.unwrap_or(SkipReason::UpstreamFailed {
                stage: Stage::Extraction,
            })),
        };

        let audio = if !request.want_audio {
            if *machine.state() == PipelineState::Analyzed {
                advance(&mut machine, PipelineEvent::AudioSkipped);
            }
            StageOutcome::skipped(SkipReason::NotRequested)
        } else {
            match (blocked.clone(), &analysis.output) {
                (None, Some(result)) => {
                    let voice = VoiceSelection::from_option(request.voice.clone());
                    let outcome = timed(self.render(Arc::clone(result), voice)).await;
                    settle(
                        &mut machine,
                        Stage::Speech,
                        &outcome.status,
                        PipelineEvent::Rendered,
                        &mut blocked,
                    );
                    outcome
                }
                (upstream, _) => StageOutcome::skipped(upstream.unwrap_or(SkipReason::UpstreamFailed {
                    stage: Stage::Analysis,
                })),
            }
        };

        if matches!(
            machine.state(),
            PipelineState::Rendered | PipelineState::AudioSkipped
        ) {
            advance(&mut machine, PipelineEvent::Finished);
        }

        let (state, transitions) = machine.into_parts();
        let total_latency_ms = started.elapsed().as_millis() as u64;
        match &state {
            PipelineState::Failed { stage, reason } => warn!(
                %request_id,
                document = %document_id,
                %stage,
                %reason,
                total_latency_ms,
                "Pipeline finished with a failed stage"
            ),
            _ => info!(
                %request_id,
                document = %document_id,
                state = state.label(),
                low_confidence,
                total_latency_ms,
                "Pipeline finished"
            ),
        }

        PipelineResult {
            request_id,
            document_id,
            storage,
            extraction,
            analysis,
            audio,
            low_confidence,
            state,
            transitions,
            total_latency_ms,
        }
    }

    async fn store_document(
        &self,
        document: &Arc<Document>,
    ) -> Result<(Arc<StoredDocument>, CacheSource), FailureReason> {
        let store = Arc::clone(&self.adapters.store);
        let limiter = Arc::clone(&self.limits.storage);
        let policy = self.retry.storage.clone();
        let document = Arc::clone(document);

        self.documents
            .get_or_compute(document.id().clone(), move || async move {
                let document_id = retry::run(&policy, &limiter, "store-document", |_| {
                    store.put(document.shared_bytes())
                })
                .await?;
                debug!(document = %document_id, "Document stored");
                Ok(StoredDocument {
                    document_id,
                    mime_type: document.mime_type().to_string(),
                    size_bytes: document.bytes().len(),
                    stored_at: Utc::now(),
                })
            })
            .await
    }

    async fn extract(
        &self,
        document: &Arc<Document>,
        format: DocumentFormat,
    ) -> Result<(Arc<ExtractionResult>, CacheSource), FailureReason> {
        let ocr = Arc::clone(&self.adapters.ocr);
        let limiter = Arc::clone(&self.limits.ocr);
        let policy = self.retry.ocr.clone();
        let threshold = self.low_confidence_threshold;
        let document = Arc::clone(document);

        self.extractions
            .get_or_compute(document.id().clone(), move || async move {
                let output =
                    retry::run(&policy, &limiter, "ocr", |_| ocr.extract(&document, format)).await?;

                let result = output.into_result(document.id().clone(), threshold);
                if result.low_confidence {
                    warn!(
                        document = %result.document_id,
                        confidence = result.confidence,
                        threshold,
                        "Low-confidence extraction"
                    );
                }
                debug!(
                    document = %result.document_id,
                    pages = result.page_count,
                    chars = result.extracted_text.len(),
                    method = ?result.method,
                    "Text extracted"
                );
                Ok(result)
            })
            .await
    }

    async fn analyze(
        &self,
        request: AnalysisRequest,
    ) -> Result<(Arc<AnalysisResult>, CacheSource), FailureReason> {
        let generator = Arc::clone(&self.adapters.generator);
        let limiter = Arc::clone(&self.limits.generation);
        let policy = self.retry.generation.clone();

        self.analyses
            .get_or_compute(request.key(), move || async move {
                let generation = retry::run(&policy, &limiter, "generate", |_| {
                    generator.generate(&request)
                })
                .await?;
                debug!(key = %request.key(), model = %generation.model_identifier, "Analysis generated");
                Ok(AnalysisResult {
                    document_id: request.document_id,
                    target_language: request.target_language,
                    instruction_variant: request.instruction_variant,
                    generated_text: generation.text,
                    model_identifier: generation.model_identifier,
                    generated_at: Utc::now(),
                })
            })
            .await
    }

    async fn render(
        &self,
        analysis: Arc<AnalysisResult>,
        voice: VoiceSelection,
    ) -> Result<(Arc<AudioArtifact>, CacheSource), FailureReason> {
        let renderer = Arc::clone(&self.adapters.speech);
        let store = Arc::clone(&self.adapters.store);
        let speech_limiter = Arc::clone(&self.limits.speech);
        let storage_limiter = Arc::clone(&self.limits.storage);
        let speech_policy = self.retry.speech.clone();
        let storage_policy = self.retry.storage.clone();
        let encoding = self.encoding;
        let key = AudioKey {
            analysis: analysis.key(),
            voice: voice.clone(),
        };

        self.audio
            .get_or_compute(key, move || async move {
                let locale = analysis.target_language.speech_locale();
                let requested = match &voice {
                    VoiceSelection::Named(name) => Some(name.as_str()),
                    VoiceSelection::Default => None,
                };
                let rendering = retry::run(&speech_policy, &speech_limiter, "speech", |_| {
                    renderer.render(&analysis.generated_text, &locale, requested, encoding)
                })
                .await?;

                let audio: Arc<[u8]> = Arc::from(rendering.audio);
                let artifact_id = retry::run(&storage_policy, &storage_limiter, "store-audio", |_| {
                    store.put(Arc::clone(&audio))
                })
                .await?;

                debug!(artifact = %artifact_id, bytes = audio.len(), "Audio rendered");
                Ok(AudioArtifact {
                    analysis_key: analysis.key(),
                    artifact_id,
                    size_bytes: audio.len(),
                    audio,
                    encoding,
                    voice: rendering.voice,
                    language_code: locale,
                    duration_ms: rendering.duration_ms,
                })
            })
            .await
    }
}

async fn timed<T, Fut>(stage: Fut) -> StageOutcome<T>
where
    Fut: Future<Output = Result<(Arc<T>, CacheSource), FailureReason>>,
{
    let started = Instant::now();
    let result = stage.await;
    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok((output, source)) => StageOutcome::succeeded(output, source, latency_ms),
        Err(reason) => StageOutcome::failed(reason, latency_ms),
    }
}

/// Feed a stage's outcome into the state machine and block later stages
/// when it failed.
fn settle(
    machine: &mut StateMachine,
    stage: Stage,
    status: &StageStatus,
    on_success: PipelineEvent,
    blocked: &mut Option<SkipReason>,
) {
    let event = match status {
        StageStatus::Failed { reason } => {
            *blocked = Some(SkipReason::UpstreamFailed { stage });
            PipelineEvent::StageFailed {
                stage,
                reason: reason.clone(),
            }
        }
        _ => on_success,
    };
    advance(machine, event);
}

fn advance(machine: &mut StateMachine, event: PipelineEvent) {
    match machine.apply(event) {
        Ok(state) => debug!(state = state.label(), "Pipeline transition"),
        Err(e) => error!("Pipeline state machine rejected event: {}", e),
    }
}
