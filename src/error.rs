//! Error taxonomy shared by every external-service adapter.
//!
//! Adapters never retry. They classify what went wrong into a
//! [`ServiceError`] and the retry runner decides what to do with it based on
//! its [`ErrorClass`].

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification that drives retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rate limiting, timeouts, transient unavailability. Retried.
    TransientService,
    /// Unsupported format, empty input, content filtered, unsupported voice. Never retried.
    PermanentInput,
    /// Artifact storage I/O. Retried, escalated when the budget runs out.
    Storage,
    /// Startup-only; never produced mid-pipeline.
    Configuration,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientService | Self::Storage)
    }
}

/// Error returned by an external-service adapter for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("content filtered: {0}")]
    ContentFiltered(String),

    #[error("unsupported voice: {0}")]
    UnsupportedVoice(String),

    #[error("request rejected: {0}")]
    InvalidRequest(String),

    #[error("malformed response: {0}")]
    InvalidResponse(String),

    #[error("misconfigured backend: {0}")]
    Misconfigured(String),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited(_) | Self::ServiceUnavailable(_) | Self::Timeout(_) => {
                ErrorClass::TransientService
            }
            Self::StorageUnavailable(_) => ErrorClass::Storage,
            Self::NotFound(_)
            | Self::UnsupportedFormat(_)
            | Self::ContentFiltered(_)
            | Self::UnsupportedVoice(_)
            | Self::InvalidRequest(_)
            | Self::InvalidResponse(_) => ErrorClass::PermanentInput,
            Self::Misconfigured(_) => ErrorClass::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

/// Map a non-success HTTP status from a Google/OpenRouter style API.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> ServiceError {
    let detail = format!("{} {}", status.as_u16(), truncate(body, 300));
    match status.as_u16() {
        429 => ServiceError::RateLimited(detail),
        408 | 500 | 502 | 503 | 504 => ServiceError::ServiceUnavailable(detail),
        401 | 403 => ServiceError::Misconfigured(detail),
        404 => ServiceError::NotFound(detail),
        _ if status.is_server_error() => ServiceError::ServiceUnavailable(detail),
        _ => ServiceError::InvalidRequest(detail),
    }
}

/// Map a reqwest transport error (no HTTP status available).
pub fn classify_transport(err: &reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        return ServiceError::ServiceUnavailable(format!("transport timeout: {err}"));
    }
    if err.is_decode() {
        return ServiceError::InvalidResponse(err.to_string());
    }
    ServiceError::ServiceUnavailable(err.to_string())
}

/// Map a `google.rpc.Code` carried inside a 200 response body.
pub fn classify_rpc_code(code: i32, message: &str) -> ServiceError {
    let detail = format!("rpc code {code}: {message}");
    match code {
        3 => ServiceError::UnsupportedFormat(detail),
        4 | 10 | 14 => ServiceError::ServiceUnavailable(detail),
        8 => ServiceError::RateLimited(detail),
        7 | 16 => ServiceError::Misconfigured(detail),
        _ => ServiceError::InvalidRequest(detail),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
