//! Speech rendering of generated analyses.

pub mod google;

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::schema::AudioEncoding;

pub use google::GoogleTts;

/// Audio for one piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendering {
    pub audio: Vec<u8>,
    pub duration_ms: u64,
    /// Voice the service actually used; `default` when it picked one itself.
    pub voice: String,
}

#[async_trait]
pub trait SpeechRenderer: Send + Sync {
    fn name(&self) -> &str;

    /// Render `text` in `locale` (e.g. `hi-IN`). `voice` names a specific
    /// voice; `None` lets the renderer choose.
    async fn render(
        &self,
        text: &str,
        locale: &str,
        voice: Option<&str>,
        encoding: AudioEncoding,
    ) -> Result<Rendering, ServiceError>;
}

/// Voices to try in order. A caller-named voice is tried alone; otherwise the
/// preferred family for the locale first, then the service default (`None`).
pub fn voice_candidates(
    locale: &str,
    requested: Option<&str>,
    preferred_suffix: Option<&str>,
) -> Vec<Option<String>> {
    match (requested, preferred_suffix) {
        (Some(voice), _) => vec![Some(voice.to_string())],
        (None, Some(suffix)) => vec![Some(format!("{locale}-{suffix}")), None],
        (None, None) => vec![None],
    }
}

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '।', '。', '\n'];

/// Split `text` into chunks of at most `max_bytes`, preferring sentence
/// boundaries, then whitespace, then any char boundary.
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = max_bytes.max(4);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in sentences(text) {
        if current.len() + sentence.len() <= max_bytes {
            current.push_str(sentence);
            continue;
        }
        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }
        current.clear();

        if sentence.len() <= max_bytes {
            current.push_str(sentence);
        } else {
            for piece in split_long(sentence, max_bytes) {
                chunks.push(piece);
            }
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

/// Sentences with their terminator and trailing whitespace attached.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !SENTENCE_ENDS.contains(&c) {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            end = j + next.len_utf8();
            chars.next();
        }
        out.push(&text[start..end]);
        start = end;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn split_long(sentence: &str, max_bytes: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = sentence.trim();
    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(space) = rest[..cut].rfind(char::is_whitespace) {
            if space > 0 {
                cut = space;
            }
        }
        pieces.push(rest[..cut].trim().to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_candidates() {
        assert_eq!(
            voice_candidates("hi-IN", None, Some("Neural2-A")),
            vec![Some("hi-IN-Neural2-A".to_string()), None]
        );
        assert_eq!(
            voice_candidates("hi-IN", Some("hi-IN-Wavenet-B"), Some("Neural2-A")),
            vec![Some("hi-IN-Wavenet-B".to_string())]
        );
        assert_eq!(voice_candidates("de-DE", None, None), vec![None]);
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        assert_eq!(chunk_text("Balance is 800. Pay by Friday.", 100), vec![
            "Balance is 800. Pay by Friday.".to_string()
        ]);
        assert!(chunk_text("   ", 100).is_empty());
    }

    #[test]
    fn test_chunks_break_at_sentences() {
        let text = "First sentence here. Second sentence here. Third one.";
        let chunks = chunk_text(text, 45);
        assert_eq!(
            chunks,
            vec![
                "First sentence here. Second sentence here.".to_string(),
                "Third one.".to_string()
            ]
        );
        assert!(chunks.iter().all(|c| c.len() <= 45));
    }

    #[test]
    fn test_devanagari_danda_is_a_boundary() {
        let text = "कुल राशि 800 है। भुगतान शुक्रवार तक करें।";
        let chunks = chunk_text(text, 40);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].ends_with('।'));
        assert!(chunks.iter().all(|c| c.len() <= 40));
    }

    #[test]
    fn test_oversized_sentence_splits_on_whitespace() {
        let text = "word ".repeat(30);
        let chunks = chunk_text(&text, 22);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 22);
            assert!(!chunk.starts_with(' ') && !chunk.ends_with(' '));
            assert!(chunk.split(' ').all(|w| w == "word"));
        }
    }
}
