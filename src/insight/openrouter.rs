//! OpenRouter chat-completions backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{non_empty, Generation, InsightGenerator};
use crate::error::{classify_status, classify_transport, ServiceError};
use crate::schema::AnalysisRequest;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Clone)]
pub struct OpenRouterGenerator {
    client: Client,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenRouterGenerator {
    pub fn new(client: Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.2,
            max_tokens: 2048,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn build_request(&self, request: &AnalysisRequest) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(&request.system_instruction),
                Message::user(&request.user_prompt),
            ],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            // Keep the same upstream provider so repeated prompts behave alike.
            provider: Some(ProviderRouting {
                only: Some(vec!["Google".to_string()]),
                allow_fallbacks: Some(false),
            }),
        }
    }
}

#[async_trait]
impl InsightGenerator for OpenRouterGenerator {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &AnalysisRequest) -> Result<Generation, ServiceError> {
        let body = self.build_request(request);
        debug!("Sending request to OpenRouter: model={}", body.model);

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &error_text));
        }

        let response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(format!("OpenRouter response: {e}")))?;

        if let Some(usage) = &response.usage {
            info!(
                "OpenRouter response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }
        let text = response.into_text()?;

        Ok(Generation {
            text: non_empty(text, &self.model)?,
            model_identifier: self.model.clone(),
        })
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderRouting>,
}

#[derive(Debug, Serialize)]
struct ProviderRouting {
    #[serde(skip_serializing_if = "Option::is_none")]
    only: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_fallbacks: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

impl Message {
    fn system(content: &str) -> Self {
        Self {
            role: "system",
            content: content.to_string(),
        }
    }

    fn user(content: &str) -> Self {
        Self {
            role: "user",
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl ChatCompletionResponse {
    fn into_text(self) -> Result<String, ServiceError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::InvalidResponse("OpenRouter returned no choices".into()))?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(ServiceError::ContentFiltered(
                "OpenRouter finish_reason=content_filter".into(),
            ));
        }
        Ok(choice.message.content.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::Language;
    use crate::schema::{DocumentId, InstructionAction, InstructionVariant};

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            document_id: DocumentId::of(b"doc"),
            extracted_text: "Total due 45.00".into(),
            target_language: Language::parse("en").unwrap(),
            instruction_variant: InstructionVariant::new(InstructionAction::Summarize),
            system_instruction: "You are an expert financial analyst.".into(),
            user_prompt: "Document Content:\n---\nTotal due 45.00\n---\nSummary:".into(),
        }
    }

    #[test]
    fn test_request_carries_system_and_user_messages() {
        let generator = OpenRouterGenerator::new(Client::new(), "key", "google/gemini-2.5-flash")
            .with_sampling(0.1, 512);
        let json = serde_json::to_value(generator.build_request(&request())).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["max_tokens"], 512);
        assert_eq!(json["provider"]["allow_fallbacks"], false);
    }

    #[test]
    fn test_content_filter_is_terminal() {
        let response: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{ "message": { "content": null }, "finish_reason": "content_filter" }]
        }))
        .unwrap();
        let err = response.into_text().unwrap_err();
        assert!(matches!(err, ServiceError::ContentFiltered(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_text_and_empty_choices() {
        let response: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{ "message": { "content": "- Total due: 45.00" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        }))
        .unwrap();
        assert_eq!(response.into_text().unwrap(), "- Total due: 45.00");

        let response: ChatCompletionResponse =
            serde_json::from_value(serde_json::json!({ "choices": [] })).unwrap();
        assert!(matches!(
            response.into_text().unwrap_err(),
            ServiceError::InvalidResponse(_)
        ));
    }
}
