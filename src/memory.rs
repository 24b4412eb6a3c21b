//! Short-term conversation memory.
//!
//! Memory is process-local and cleared on restart. The pipeline only ever
//! appends user messages when a request is prepared and assistant messages
//! after their playback completed, so the history reflects what was heard.

use crate::config::MemoryConfig;
use serde::{Deserialize, Serialize};

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    /// Wire name used by OpenAI-compatible APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single role-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Append-only message history with an optional size cap.
#[derive(Debug, Clone, Default)]
pub struct MemoryService {
    max_messages: Option<usize>,
    messages: Vec<ChatMessage>,
}

impl MemoryService {
    #[must_use]
    pub fn new(max_messages: Option<usize>) -> Self {
        Self {
            max_messages,
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.max_messages)
    }

    /// Append a message. Content is trimmed; empty content is ignored.
    pub fn add(&mut self, role: ChatRole, content: &str) {
        let content = content.trim();
        if content.is_empty() {
            return;
        }
        self.messages.push(ChatMessage::new(role, content));
        self.trim_if_needed();
    }

    pub fn add_user(&mut self, content: &str) {
        self.add(ChatRole::User, content);
    }

    pub fn add_assistant(&mut self, content: &str) {
        self.add(ChatRole::Assistant, content);
    }

    /// The most recent `n` messages, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn trim_if_needed(&mut self) {
        let Some(max) = self.max_messages else {
            return;
        };
        let overflow = self.messages.len().saturating_sub(max);
        if overflow > 0 {
            self.messages.drain(..overflow);
        }
    }
}
