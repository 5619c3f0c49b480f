//! OCR extractor abstraction.
//!
//! Defines the [`OcrExtractor`] trait and the unified [`OcrOutput`] so
//! different backends (local PDF text layer, Cloud Vision) can be swapped or
//! layered behind one interface.

pub mod format;
pub mod pdf;
pub mod vision;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::schema::{Document, DocumentId, ExtractionMethod, ExtractionResult, TextBlock};

pub use format::DocumentFormat;
pub use pdf::PdfTextLayer;
pub use vision::VisionOcr;

/// Raw backend output before confidence scoring.
#[derive(Debug, Clone)]
pub struct OcrOutput {
    pub blocks: Vec<TextBlock>,
    pub page_count: u32,
    pub method: ExtractionMethod,
}

impl OcrOutput {
    pub fn has_text(&self) -> bool {
        self.blocks.iter().any(|b| !b.text.trim().is_empty())
    }

    /// Score the output and flag it when the weighted confidence falls below
    /// `low_confidence_threshold`.
    pub fn into_result(self, document_id: DocumentId, low_confidence_threshold: f32) -> ExtractionResult {
        let confidence = weighted_confidence(&self.blocks);
        let extracted_text = join_blocks(&self.blocks);
        let low_confidence = confidence < low_confidence_threshold;

        ExtractionResult {
            document_id,
            extracted_text,
            blocks: self.blocks,
            page_count: self.page_count,
            confidence,
            low_confidence,
            method: self.method,
            extracted_at: Utc::now(),
        }
    }
}

/// Mean block confidence weighted by text length. No text scores 0.0.
pub fn weighted_confidence(blocks: &[TextBlock]) -> f32 {
    let total_chars: usize = blocks.iter().map(|b| b.text.chars().count()).sum();
    if total_chars == 0 {
        return 0.0;
    }
    let weighted: f32 = blocks
        .iter()
        .map(|b| b.confidence.clamp(0.0, 1.0) * b.text.chars().count() as f32)
        .sum();
    weighted / total_chars as f32
}

/// Blocks joined with newlines; a blank line separates pages.
fn join_blocks(blocks: &[TextBlock]) -> String {
    let mut text = String::new();
    let mut current_page = None;
    for block in blocks.iter().filter(|b| !b.text.trim().is_empty()) {
        if let Some(page) = current_page {
            text.push_str(if page == block.page { "\n" } else { "\n\n" });
        }
        text.push_str(block.text.trim());
        current_page = Some(block.page);
    }
    text
}

#[async_trait]
pub trait OcrExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Extract text blocks from `document`, already known to be `format`.
    async fn extract(
        &self,
        document: &Document,
        format: DocumentFormat,
    ) -> Result<OcrOutput, ServiceError>;
}

/// PDFs are read from their text layer when they have one; scanned PDFs and
/// images go to the fallback OCR backend.
pub struct LayeredOcr {
    text_layer: PdfTextLayer,
    fallback: Arc<dyn OcrExtractor>,
}

impl LayeredOcr {
    pub fn new(fallback: Arc<dyn OcrExtractor>) -> Self {
        Self {
            text_layer: PdfTextLayer,
            fallback,
        }
    }
}

#[async_trait]
impl OcrExtractor for LayeredOcr {
    fn name(&self) -> &str {
        "layered"
    }

    async fn extract(
        &self,
        document: &Document,
        format: DocumentFormat,
    ) -> Result<OcrOutput, ServiceError> {
        if format.is_pdf() {
            let output = self.text_layer.extract(document, format).await?;
            if output.has_text() {
                info!(
                    "LayeredOcr: {} read from PDF text layer ({} pages)",
                    document.id(),
                    output.page_count
                );
                return Ok(output);
            }
            debug!(
                "LayeredOcr: {} has no text layer, falling back to {}",
                document.id(),
                self.fallback.name()
            );
        }
        self.fallback.extract(document, format).await
    }
}
