//! Prompt construction for the insight generator.
//!
//! Pure and synchronous: extracted text, target language and instruction
//! variant in, a fully rendered [`AnalysisRequest`] out.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::language::Language;
use crate::schema::{AnalysisRequest, DocumentId, InstructionAction, InstructionVariant};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("extracted text is empty")]
    EmptyInput,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_summary_words: u32,
    max_prompt_chars: usize,
}

impl PromptBuilder {
    pub fn new(max_summary_words: u32, max_prompt_chars: usize) -> Self {
        Self {
            max_summary_words,
            max_prompt_chars,
        }
    }

    pub fn build(
        &self,
        extracted_text: &str,
        target_language: &Language,
        variant: &InstructionVariant,
        document_id: &DocumentId,
    ) -> Result<AnalysisRequest, PromptError> {
        let text = normalize_whitespace(extracted_text);
        if text.is_empty() {
            return Err(PromptError::EmptyInput);
        }
        let text = truncate_for_context(&text, self.max_prompt_chars);

        let system_instruction = self.system_instruction(target_language, variant);
        let user_prompt = user_prompt(variant, text);

        Ok(AnalysisRequest {
            document_id: document_id.clone(),
            extracted_text: text.to_string(),
            target_language: target_language.clone(),
            instruction_variant: variant.clone(),
            system_instruction,
            user_prompt,
        })
    }

    fn system_instruction(&self, language: &Language, variant: &InstructionVariant) -> String {
        let origin = match &variant.country {
            Some(country) => format!("a financial document from {country}"),
            None => "a financial document".to_string(),
        };
        let language_name = language.display_name();
        let words = self.max_summary_words;

        match variant.action {
            InstructionAction::Summarize => format!(
                "You are an expert financial analyst. Summarize {origin}.\n\
                 Focus on key financial figures, balances, transactions, and any significant financial details.\n\
                 The summary should be concise, in bullet points, at most {words} words, \
                 and MUST be written in {language_name}."
            ),
            InstructionAction::Simplify => format!(
                "You are an expert in explaining complex financial concepts simply. Simplify {origin}.\n\
                 Explain it in plain language, avoiding jargon where possible. \
                 Highlight the most important aspects for a non-financial audience.\n\
                 The explanation should be easy to understand, at most {words} words, \
                 and MUST be written in {language_name}."
            ),
        }
    }
}

fn user_prompt(variant: &InstructionVariant, text: &str) -> String {
    let label = match variant.action {
        InstructionAction::Summarize => "Summary:",
        InstructionAction::Simplify => "Simplified Explanation:",
    };
    format!("Document Content:\n---\n{text}\n---\n{label}")
}

/// Collapse runs of spaces/tabs and squeeze blank lines, keeping line breaks
/// that carry table and statement layout.
fn normalize_whitespace(text: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();
    let spaces = SPACES.get_or_init(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));
    let blank_lines = BLANK_LINES.get_or_init(|| Regex::new(r"\n\s*\n+").expect("valid regex"));

    let text = text.replace("\r\n", "\n");
    let text = spaces.replace_all(&text, " ");
    let text = blank_lines.replace_all(&text, "\n\n");
    text.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Keep at most `max_chars` characters.
fn truncate_for_context(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
