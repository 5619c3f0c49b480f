//! Insight generation over extracted document text.
//!
//! The generator is a billed external call, so implementations make exactly
//! one request per `generate` and leave retries to the orchestrator.

pub mod openrouter;
pub mod vertex;

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::schema::AnalysisRequest;

pub use openrouter::OpenRouterGenerator;
pub use vertex::VertexGenerator;

/// Text produced by one generator call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub model_identifier: String,
}

#[async_trait]
pub trait InsightGenerator: Send + Sync {
    fn model_id(&self) -> &str;

    async fn generate(&self, request: &AnalysisRequest) -> Result<Generation, ServiceError>;
}

/// Reject blank model output; an empty answer is never a usable analysis.
pub(crate) fn non_empty(text: String, model: &str) -> Result<String, ServiceError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidResponse(format!(
            "{model} returned an empty response"
        )));
    }
    Ok(trimmed.to_string())
}
