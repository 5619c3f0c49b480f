//! Doc Insight - financial document summarization and narration server.

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use doc_insight::config::PipelineConfig;
use doc_insight::error::ServiceError;
use doc_insight::language::Language;
use doc_insight::ocr::DocumentFormat;
use doc_insight::pipeline::{Orchestrator, ProcessRequest};
use doc_insight::schema::{ArtifactId, InstructionAction, InstructionVariant, PipelineResult};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = PipelineConfig::load().context("Invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.default_log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let orchestrator = Orchestrator::from_config(&config).await?;
    info!("Pipeline initialized");

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/process", post(process_document))
        .route("/artifacts/:id", get(get_artifact))
        .layer(DefaultBodyLimit::max(config.server.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!("Server listening on http://{}", config.server.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Upload a document and run it through the pipeline.
async fn process_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<PipelineResult>, (StatusCode, String)> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            form.filename = field.file_name().unwrap_or("document").to_string();
            form.mime_type = field.content_type().unwrap_or_default().to_string();
            form.bytes = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e)))?
                .to_vec();
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read {}: {}", name, e)))?;
        form.set(&name, value);
    }

    let request = form.into_request().map_err(|msg| (StatusCode::BAD_REQUEST, msg))?;
    let result = state.orchestrator.process(request).await;
    Ok(Json(result))
}

/// Fetch a stored document or audio artifact by id.
async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let id = ArtifactId::parse(&id).ok_or(StatusCode::BAD_REQUEST)?;
    let bytes = state.orchestrator.artifact(&id).await.map_err(|e| match e {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        other => {
            error!("Artifact fetch failed for {}: {}", id, other);
            StatusCode::BAD_GATEWAY
        }
    })?;

    let content_type = artifact_content_type(&bytes);
    Ok(([(header::CONTENT_TYPE, content_type)], bytes.to_vec()))
}

// ============================================================================
// Helper functions
// ============================================================================

#[derive(Default)]
struct UploadForm {
    filename: String,
    mime_type: String,
    bytes: Vec<u8>,
    language: Option<String>,
    action: Option<String>,
    country: Option<String>,
    want_audio: Option<String>,
    voice: Option<String>,
}

impl UploadForm {
    fn set(&mut self, name: &str, value: String) {
        let slot = match name {
            "language" => &mut self.language,
            "action" => &mut self.action,
            "country" => &mut self.country,
            "want_audio" => &mut self.want_audio,
            "voice" => &mut self.voice,
            _ => return,
        };
        *slot = Some(value);
    }

    fn into_request(self) -> Result<ProcessRequest, String> {
        if self.bytes.is_empty() {
            return Err("No file uploaded".to_string());
        }

        let language = self.language.as_deref().unwrap_or("en");
        let target_language = Language::parse(language).map_err(|e| e.to_string())?;

        let action = self.action.as_deref().unwrap_or("summarize");
        let action = InstructionAction::parse(action)
            .ok_or_else(|| format!("Unknown action: {} (expected summarize|simplify)", action))?;
        let mut instruction_variant = InstructionVariant::new(action);
        if let Some(country) = self.country {
            instruction_variant = instruction_variant.with_country(country);
        }

        let want_audio = self.want_audio.as_deref().map(str::trim).is_some_and(|v| {
            ["true", "1", "on", "yes"]
                .iter()
                .any(|accepted| v.eq_ignore_ascii_case(accepted))
        });

        info!(
            "Received file: {} ({} bytes, {}) for {} {}",
            self.filename,
            self.bytes.len(),
            self.mime_type,
            target_language,
            instruction_variant
        );

        Ok(ProcessRequest {
            bytes: self.bytes,
            mime_type: self.mime_type,
            target_language,
            instruction_variant,
            want_audio,
            voice: self.voice,
        })
    }
}

fn artifact_content_type(bytes: &[u8]) -> &'static str {
    if let Ok(format) = DocumentFormat::detect(bytes, "") {
        return format.mime_type();
    }
    if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) || bytes.starts_with(&[0xFF, 0xF3]) {
        return "audio/mpeg";
    }
    if bytes.starts_with(b"RIFF") {
        return "audio/wav";
    }
    "application/octet-stream"
}
