//! Google Cloud Vision OCR (DOCUMENT_TEXT_DETECTION).
//!
//! Images go through `images:annotate`; PDFs and TIFFs go through
//! `files:annotate`, which handles at most five pages per synchronous call,
//! so longer files are walked in page windows. Both return the same
//! `fullTextAnnotation` hierarchy, flattened here into one [`TextBlock`] per
//! detected block.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DocumentFormat, OcrExtractor, OcrOutput};
use crate::error::{classify_rpc_code, classify_status, classify_transport, ServiceError};
use crate::gcp_auth::TokenSource;
use crate::schema::{Document, ExtractionMethod, TextBlock};

const VISION_BASE: &str = "https://vision.googleapis.com/v1";
const FEATURE: &str = "DOCUMENT_TEXT_DETECTION";

/// `files:annotate` page limit; also what it covers when no pages are listed.
const MAX_PAGES_PER_REQUEST: u32 = 5;

pub struct VisionOcr {
    client: reqwest::Client,
    tokens: TokenSource,
    project_id: Option<String>,
    pages_per_request: u32,
}

impl VisionOcr {
    pub fn new(
        client: reqwest::Client,
        tokens: TokenSource,
        project_id: Option<String>,
        pages_per_request: u32,
    ) -> Self {
        Self {
            client,
            tokens,
            project_id,
            pages_per_request: pages_per_request.clamp(1, MAX_PAGES_PER_REQUEST),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<R, ServiceError> {
        let token = self.tokens.access_token(&self.client).await?;
        let mut request = self
            .client
            .post(format!("{VISION_BASE}/{method}"))
            .bearer_auth(token)
            .json(body);
        if let Some(project) = &self.project_id {
            request = request.header("x-goog-user-project", project);
        }

        let resp = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let raw = resp
            .text()
            .await
            .map_err(|e| ServiceError::InvalidResponse(format!("vision body: {e}")))?;
        debug!("VisionOcr: {} returned {} bytes", method, raw.len());
        serde_json::from_str(&raw)
            .map_err(|e| ServiceError::InvalidResponse(format!("vision {method}: {e}")))
    }

    async fn annotate_image(&self, document: &Document) -> Result<OcrOutput, ServiceError> {
        let body = ImagesRequest {
            requests: vec![ImageRequest {
                image: ImageContent {
                    content: encode(document.bytes()),
                },
                features: vec![Feature { kind: FEATURE }],
            }],
        };
        let response: BatchResponse<AnnotateResponse> = self.post("images:annotate", &body).await?;
        let annotation = response.responses.into_iter().next().unwrap_or_default();

        Ok(OcrOutput {
            blocks: annotation.into_blocks(1)?,
            page_count: 1,
            method: ExtractionMethod::VisionOcr,
        })
    }

    async fn annotate_file(
        &self,
        document: &Document,
        format: DocumentFormat,
    ) -> Result<OcrOutput, ServiceError> {
        // Pages past the end of the file are rejected, so only list them when
        // the page count is known.
        let known_pages = if format.is_pdf() {
            let bytes = document.shared_bytes();
            tokio::task::spawn_blocking(move || super::pdf::page_count(&bytes))
                .await
                .ok()
                .flatten()
                .filter(|&n| n > 0)
        } else {
            None
        };

        let window = self.pages_per_request;
        let (first_pages, covered) = match known_pages {
            Some(total) => {
                let end = total.min(window);
                ((1..=end).collect(), end)
            }
            None => (Vec::new(), MAX_PAGES_PER_REQUEST),
        };

        let mut output = self.annotate_pages(document, format, first_pages).await?;
        if let Some(total) = known_pages {
            output.page_count = output.page_count.max(total);
        }

        let windows = remaining_windows(covered, output.page_count, window);
        if !windows.is_empty() {
            info!(
                "VisionOcr: {} has {} pages, {} more requests",
                document.id(),
                output.page_count,
                windows.len()
            );
        }
        for pages in windows {
            let part = self.annotate_pages(document, format, pages).await?;
            output.blocks.extend(part.blocks);
        }
        Ok(output)
    }

    async fn annotate_pages(
        &self,
        document: &Document,
        format: DocumentFormat,
        pages: Vec<u32>,
    ) -> Result<OcrOutput, ServiceError> {
        let body = FilesRequest {
            requests: vec![FileRequest {
                input_config: InputConfig {
                    content: encode(document.bytes()),
                    mime_type: format.mime_type(),
                },
                features: vec![Feature { kind: FEATURE }],
                pages,
            }],
        };
        let response: BatchResponse<FileResponse> = self.post("files:annotate", &body).await?;
        let file = response.responses.into_iter().next().unwrap_or_default();
        file.into_output()
    }
}

/// Page lists for the pages after `covered`, `window` at a time, up to `total`.
fn remaining_windows(covered: u32, total: u32, window: u32) -> Vec<Vec<u32>> {
    let window = window.max(1);
    let mut windows = Vec::new();
    let mut next = covered + 1;
    while next <= total {
        let end = (next + window - 1).min(total);
        windows.push((next..=end).collect());
        next = end + 1;
    }
    windows
}

fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[async_trait]
impl OcrExtractor for VisionOcr {
    fn name(&self) -> &str {
        "cloud-vision"
    }

    async fn extract(
        &self,
        document: &Document,
        format: DocumentFormat,
    ) -> Result<OcrOutput, ServiceError> {
        info!(
            "VisionOcr: annotating {} ({}, {} bytes)",
            document.id(),
            format.mime_type(),
            document.bytes().len()
        );
        match format {
            DocumentFormat::Pdf | DocumentFormat::Tiff => self.annotate_file(document, format).await,
            _ => self.annotate_image(document).await,
        }
    }
}

// ── Vision API request/response types ───────────────────────────────────────

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ImagesRequest {
    requests: Vec<ImageRequest>,
}

#[derive(Serialize)]
struct ImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
struct FilesRequest {
    requests: Vec<FileRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileRequest {
    input_config: InputConfig,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pages: Vec<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InputConfig {
    content: String,
    mime_type: &'static str,
}

#[derive(Deserialize)]
struct BatchResponse<T> {
    #[serde(default = "Vec::new")]
    responses: Vec<T>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FileResponse {
    #[serde(default)]
    responses: Vec<AnnotateResponse>,
    #[serde(default)]
    total_pages: Option<u32>,
    #[serde(default)]
    error: Option<RpcStatus>,
}

impl FileResponse {
    fn into_output(self) -> Result<OcrOutput, ServiceError> {
        if let Some(err) = self.error {
            return Err(classify_rpc_code(err.code, &err.message));
        }

        let page_count = self.total_pages.unwrap_or(self.responses.len() as u32);
        let mut blocks = Vec::new();
        for (index, response) in self.responses.into_iter().enumerate() {
            let page = response
                .context
                .as_ref()
                .and_then(|c| c.page_number)
                .unwrap_or(index as u32 + 1);
            blocks.extend(response.into_blocks(page)?);
        }

        Ok(OcrOutput {
            blocks,
            page_count,
            method: ExtractionMethod::VisionOcr,
        })
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    full_text_annotation: Option<FullTextAnnotation>,
    #[serde(default)]
    error: Option<RpcStatus>,
    #[serde(default)]
    context: Option<ResponseContext>,
}

impl AnnotateResponse {
    fn into_blocks(self, page_number: u32) -> Result<Vec<TextBlock>, ServiceError> {
        if let Some(err) = self.error {
            return Err(classify_rpc_code(err.code, &err.message));
        }
        let Some(annotation) = self.full_text_annotation else {
            return Ok(Vec::new());
        };

        let mut blocks = Vec::new();
        for page in annotation.pages {
            for block in page.blocks {
                let text = block.text();
                if text.trim().is_empty() {
                    continue;
                }
                blocks.push(TextBlock {
                    page: page_number,
                    text: text.trim().to_string(),
                    confidence: block.confidence.or(page.confidence).unwrap_or(0.0),
                });
            }
        }
        Ok(blocks)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseContext {
    #[serde(default)]
    page_number: Option<u32>,
}

#[derive(Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct FullTextAnnotation {
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Deserialize)]
struct Block {
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

impl Block {
    fn text(&self) -> String {
        let mut text = String::new();
        for paragraph in &self.paragraphs {
            for word in &paragraph.words {
                for symbol in &word.symbols {
                    text.push_str(&symbol.text);
                    let detected = symbol
                        .property
                        .as_ref()
                        .and_then(|p| p.detected_break.as_ref())
                        .map(|b| b.kind.as_str());
                    match detected {
                        Some("SPACE") | Some("SURE_SPACE") => text.push(' '),
                        Some("EOL_SURE_SPACE") | Some("LINE_BREAK") => text.push('\n'),
                        Some("HYPHEN") => text.push_str("-\n"),
                        _ => {}
                    }
                }
            }
        }
        text
    }
}

#[derive(Deserialize)]
struct Paragraph {
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Deserialize)]
struct Word {
    #[serde(default)]
    symbols: Vec<Symbol>,
}

#[derive(Deserialize)]
struct Symbol {
    #[serde(default)]
    text: String,
    #[serde(default)]
    property: Option<TextProperty>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextProperty {
    #[serde(default)]
    detected_break: Option<DetectedBreak>,
}

#[derive(Deserialize)]
struct DetectedBreak {
    #[serde(rename = "type", default)]
    kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol(text: &str, brk: Option<&str>) -> serde_json::Value {
        match brk {
            Some(kind) => serde_json::json!({
                "text": text,
                "property": { "detectedBreak": { "type": kind } }
            }),
            None => serde_json::json!({ "text": text }),
        }
    }

    fn word(chars: &str, brk: Option<&str>) -> serde_json::Value {
        let n = chars.chars().count();
        let symbols: Vec<_> = chars
            .chars()
            .enumerate()
            .map(|(i, c)| symbol(&c.to_string(), if i + 1 == n { brk } else { None }))
            .collect();
        serde_json::json!({ "symbols": symbols })
    }

    #[test]
    fn test_block_text_follows_detected_breaks() {
        let response: AnnotateResponse = serde_json::from_value(serde_json::json!({
            "fullTextAnnotation": {
                "pages": [{
                    "confidence": 0.9,
                    "blocks": [
                        {
                            "confidence": 0.98,
                            "paragraphs": [{ "words": [
                                word("Amount", Some("SPACE")),
                                word("due", Some("EOL_SURE_SPACE")),
                                word("1,200", None),
                            ]}]
                        },
                        {
                            "paragraphs": [{ "words": [
                                word("state", Some("HYPHEN")),
                                word("ment", None),
                            ]}]
                        }
                    ]
                }]
            }
        }))
        .unwrap();

        let blocks = response.into_blocks(1).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "Amount due\n1,200");
        assert!((blocks[0].confidence - 0.98).abs() < 1e-6);
        assert_eq!(blocks[1].text, "state-\nment");
        // Falls back to the page confidence.
        assert!((blocks[1].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_missing_annotation_is_empty() {
        let response: AnnotateResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(response.into_blocks(1).unwrap().is_empty());
    }

    #[test]
    fn test_embedded_error_is_classified() {
        let response: AnnotateResponse = serde_json::from_value(serde_json::json!({
            "error": { "code": 3, "message": "Bad image data." }
        }))
        .unwrap();
        let err = response.into_blocks(1).unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedFormat(_)));

        let response: AnnotateResponse = serde_json::from_value(serde_json::json!({
            "error": { "code": 14, "message": "backend unavailable" }
        }))
        .unwrap();
        assert!(response.into_blocks(1).unwrap_err().is_retryable());
    }

    #[test]
    fn test_file_response_uses_page_context() {
        let file: FileResponse = serde_json::from_value(serde_json::json!({
            "totalPages": 7,
            "responses": [
                {
                    "context": { "pageNumber": 1 },
                    "fullTextAnnotation": { "pages": [{ "confidence": 0.8, "blocks": [
                        { "paragraphs": [{ "words": [word("Page", Some("SPACE")), word("one", None)] }] }
                    ]}]}
                },
                {
                    "context": { "pageNumber": 2 },
                    "fullTextAnnotation": { "pages": [{ "confidence": 0.6, "blocks": [
                        { "paragraphs": [{ "words": [word("Page", Some("SPACE")), word("two", None)] }] }
                    ]}]}
                }
            ]
        }))
        .unwrap();

        let output = file.into_output().unwrap();
        assert_eq!(output.page_count, 7);
        assert_eq!(output.method, ExtractionMethod::VisionOcr);
        assert_eq!(output.blocks.len(), 2);
        assert_eq!(output.blocks[1].page, 2);
        assert_eq!(output.blocks[1].text, "Page two");
    }

    #[test]
    fn test_remaining_windows_cover_every_page() {
        assert_eq!(
            remaining_windows(5, 12, 5),
            vec![vec![6, 7, 8, 9, 10], vec![11, 12]]
        );
        assert_eq!(remaining_windows(2, 7, 2), vec![vec![3, 4], vec![5, 6], vec![7]]);
        assert!(remaining_windows(5, 5, 5).is_empty());
        assert!(remaining_windows(5, 3, 5).is_empty());
    }

    #[test]
    fn test_later_windows_keep_their_page_numbers() {
        let page = |n: u32, text: &str| {
            serde_json::json!({
                "context": { "pageNumber": n },
                "fullTextAnnotation": { "pages": [{ "confidence": 0.9, "blocks": [
                    { "paragraphs": [{ "words": [word(text, None)] }] }
                ]}]}
            })
        };
        let first: FileResponse = serde_json::from_value(serde_json::json!({
            "totalPages": 7,
            "responses": [page(1, "one"), page(2, "two"), page(3, "three"), page(4, "four"), page(5, "five")]
        }))
        .unwrap();
        let second: FileResponse = serde_json::from_value(serde_json::json!({
            "totalPages": 7,
            "responses": [page(6, "six"), page(7, "seven")]
        }))
        .unwrap();

        let mut output = first.into_output().unwrap();
        let windows = remaining_windows(5, output.page_count, 5);
        assert_eq!(windows, vec![vec![6, 7]]);
        output.blocks.extend(second.into_output().unwrap().blocks);

        let pages: Vec<u32> = output.blocks.iter().map(|b| b.page).collect();
        assert_eq!(pages, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(output.blocks[6].text, "seven");
    }

    #[test]
    fn test_file_request_lists_window_pages() {
        let request = FileRequest {
            input_config: InputConfig {
                content: encode(b"%PDF"),
                mime_type: "application/pdf",
            },
            features: vec![Feature { kind: FEATURE }],
            pages: remaining_windows(5, 8, 5).remove(0),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["pages"], serde_json::json!([6, 7, 8]));
    }

    #[test]
    fn test_file_request_omits_unknown_pages() {
        let request = FileRequest {
            input_config: InputConfig {
                content: encode(b"%PDF"),
                mime_type: "application/pdf",
            },
            features: vec![Feature { kind: FEATURE }],
            pages: vec![],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("pages").is_none());
        assert_eq!(json["inputConfig"]["mimeType"], "application/pdf");
        assert_eq!(json["inputConfig"]["content"], "JVBERg==");
        assert_eq!(json["features"][0]["type"], FEATURE);
    }
}
