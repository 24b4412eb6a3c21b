//! Transcript-level wake phrase gate.
//!
//! Matching is a case-insensitive substring search against the configured
//! phrase list. Only literal configured phrases count: there is no fuzzy
//! matching of STT confusions.

use crate::config::ConversationConfig;

/// Case-insensitive wake phrase matcher.
#[derive(Debug, Clone)]
pub struct WakeGate {
    /// Lower-cased phrases, longest first so removal prefers the longest match.
    phrases: Vec<String>,
}

impl WakeGate {
    /// Build a gate from raw phrases. Blank phrases are ignored.
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut phrases: Vec<String> = phrases
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        phrases.sort_by_key(|p| std::cmp::Reverse(p.len()));
        phrases.dedup();
        Self { phrases }
    }

    pub fn from_config(config: &ConversationConfig) -> Self {
        Self::new(&config.wake_phrases)
    }

    /// Returns `true` if any configured phrase occurs in `text`.
    pub fn is_wake_phrase(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.phrases.iter().any(|p| lower.contains(p.as_str()))
    }

    /// Returns `true` if `text` contains a wake phrase and nothing else
    /// besides punctuation and whitespace.
    pub fn is_wake_only(&self, text: &str) -> bool {
        if !self.is_wake_phrase(text) {
            return false;
        }
        let mut rest = text.to_lowercase();
        for phrase in &self.phrases {
            rest = rest.replace(phrase.as_str(), " ");
        }
        strip_punctuation(&rest).trim().is_empty()
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

/// Drop punctuation that STT inserts so "Buddy?" and "buddy" compare equal.
fn strip_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect()
}
