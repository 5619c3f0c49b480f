//! PDF text-layer extraction with lopdf.
//!
//! Digital statements and bills carry an embedded text layer that is exact,
//! so no OCR call is needed. Scanned PDFs come back with no text and are left
//! to the caller to route elsewhere.

use async_trait::async_trait;
use std::io::Cursor;
use tracing::{debug, warn};

use super::{DocumentFormat, OcrExtractor, OcrOutput};
use crate::error::ServiceError;
use crate::schema::{Document, ExtractionMethod, TextBlock};

/// Confidence assigned to text read from an embedded text layer.
pub const TEXT_LAYER_CONFIDENCE: f32 = 0.95;

#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextLayer;

/// Read the text layer of every page. Pages that fail to decode are skipped.
pub fn read_text_layer(data: &[u8]) -> Result<OcrOutput, ServiceError> {
    let doc = lopdf::Document::load_from(Cursor::new(data))
        .map_err(|e| ServiceError::UnsupportedFormat(format!("failed to load PDF: {e}")))?;

    let pages = doc.get_pages();
    let page_count = pages.len() as u32;
    let mut blocks = Vec::new();

    for (page_num, _) in pages {
        match doc.extract_text(&[page_num]) {
            Ok(content) if !content.trim().is_empty() => blocks.push(TextBlock {
                page: page_num,
                text: content.trim().to_string(),
                confidence: TEXT_LAYER_CONFIDENCE,
            }),
            Ok(_) => debug!("PdfTextLayer: page {} has no text layer", page_num),
            Err(e) => warn!("PdfTextLayer: page {} could not be decoded: {}", page_num, e),
        }
    }

    Ok(OcrOutput {
        blocks,
        page_count,
        method: ExtractionMethod::PdfTextLayer,
    })
}

/// Page count from the PDF structure, if it parses.
pub fn page_count(data: &[u8]) -> Option<u32> {
    lopdf::Document::load_from(Cursor::new(data))
        .ok()
        .map(|doc| doc.get_pages().len() as u32)
}

#[async_trait]
impl OcrExtractor for PdfTextLayer {
    fn name(&self) -> &str {
        "pdf-text-layer"
    }

    async fn extract(
        &self,
        document: &Document,
        format: DocumentFormat,
    ) -> Result<OcrOutput, ServiceError> {
        if !format.is_pdf() {
            return Err(ServiceError::UnsupportedFormat(format!(
                "text layer extraction needs a PDF, got {}",
                format.mime_type()
            )));
        }

        let bytes = document.shared_bytes();
        tokio::task::spawn_blocking(move || read_text_layer(&bytes))
            .await
            .map_err(|e| ServiceError::InvalidResponse(format!("PDF worker failed: {e}")))?
    }
}
