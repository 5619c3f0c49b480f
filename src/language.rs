//! Target-language codes for analysis and narration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LanguageError {
    #[error("invalid language code: {0:?}")]
    Invalid(String),
}

/// A validated, lowercase-primary language tag such as `hi`, `de` or `en-GB`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Language(String);

/// (code, display name, default speech locale)
const KNOWN: &[(&str, &str, &str)] = &[
    ("en", "English", "en-US"),
    ("hi", "Hindi", "hi-IN"),
    ("de", "German", "de-DE"),
    ("fr", "French", "fr-FR"),
    ("es", "Spanish", "es-ES"),
    ("ta", "Tamil", "ta-IN"),
    ("te", "Telugu", "te-IN"),
    ("bn", "Bengali", "bn-IN"),
    ("mr", "Marathi", "mr-IN"),
];

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z]{2,3}(-[A-Za-z0-9]{2,8})*$").expect("language tag regex is valid")
    })
}

impl Language {
    pub fn parse(raw: &str) -> Result<Self, LanguageError> {
        let trimmed = raw.trim().replace('_', "-");
        let mut parts = trimmed.splitn(2, '-');
        let primary = parts.next().unwrap_or_default().to_ascii_lowercase();
        let normalized = match parts.next() {
            Some(rest) => format!("{primary}-{}", rest.to_ascii_uppercase()),
            None => primary,
        };
        if !tag_pattern().is_match(&normalized) {
            return Err(LanguageError::Invalid(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Primary subtag (`hi` for `hi-IN`).
    pub fn primary(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// Human-readable name used in the prompt's language directive.
    /// Unknown codes fall back to the code itself.
    pub fn display_name(&self) -> &str {
        KNOWN
            .iter()
            .find(|(code, _, _)| *code == self.primary())
            .map(|(_, name, _)| *name)
            .unwrap_or(&self.0)
    }

    /// Locale for the speech service. A tag that already carries a region
    /// is used verbatim.
    pub fn speech_locale(&self) -> String {
        if self.0.contains('-') {
            return self.0.clone();
        }
        KNOWN
            .iter()
            .find(|(code, _, _)| *code == self.0)
            .map(|(_, _, locale)| locale.to_string())
            .unwrap_or_else(|| self.0.clone())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Language {
    type Error = LanguageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(Language::parse(" HI ").unwrap().code(), "hi");
        assert_eq!(Language::parse("hi_in").unwrap().code(), "hi-IN");
        assert_eq!(Language::parse("en-gb").unwrap().code(), "en-GB");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Language::parse("").is_err());
        assert!(Language::parse("hindi language").is_err());
        assert!(Language::parse("h").is_err());
    }

    #[test]
    fn test_display_and_locale() {
        let hi = Language::parse("hi").unwrap();
        assert_eq!(hi.display_name(), "Hindi");
        assert_eq!(hi.speech_locale(), "hi-IN");

        let de_at = Language::parse("de-AT").unwrap();
        assert_eq!(de_at.display_name(), "German");
        assert_eq!(de_at.speech_locale(), "de-AT");

        let unknown = Language::parse("sw").unwrap();
        assert_eq!(unknown.display_name(), "sw");
        assert_eq!(unknown.speech_locale(), "sw");
    }
}
