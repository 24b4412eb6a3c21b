//! Reply generation.
//!
//! [`ReplyGenerator`] is the contract the turn workers and speaker loop use.
//! It separates generating a reply ([`ReplyGenerator::prepare_reply`]) from
//! storing it ([`ReplyGenerator::commit_assistant_reply`]), so assistant
//! text only reaches memory once the user has actually heard it.
//!
//! [`ConversationService`] implements it on top of any [`ChatClient`] and a
//! short-term [`MemoryService`].

pub mod api;

pub use api::OpenAiChatClient;

use crate::config::LlmConfig;
use crate::error::{Result, SpeechError};
use crate::memory::{ChatMessage, ChatRole, MemoryService};
use crate::pipeline::lock;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Single-shot chat completion over a message list.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete_messages(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[async_trait]
impl<T: ChatClient + ?Sized> ChatClient for Arc<T> {
    async fn complete_messages(&self, messages: &[ChatMessage]) -> Result<String> {
        (**self).complete_messages(messages).await
    }
}

/// Two-phase reply generation used by the pipeline.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Record `user_text` and generate a reply. `ephemeral_context` is sent
    /// with this request only and never stored.
    async fn prepare_reply(&self, user_text: &str, ephemeral_context: Option<&str>)
    -> Result<String>;

    /// Store a reply whose playback completed.
    fn commit_assistant_reply(&self, text: &str);
}

/// Reply generator backed by a chat client and short-term memory.
pub struct ConversationService<C> {
    chat: C,
    memory: Arc<Mutex<MemoryService>>,
    system_prompt: String,
    history_window: usize,
}

impl<C: ChatClient> ConversationService<C> {
    pub fn new(chat: C, memory: Arc<Mutex<MemoryService>>, config: &LlmConfig) -> Self {
        Self {
            chat,
            memory,
            system_prompt: config.effective_system_prompt(),
            history_window: config.history_window,
        }
    }

    /// Handle to the underlying memory (for inspection and tests).
    pub fn memory(&self) -> Arc<Mutex<MemoryService>> {
        Arc::clone(&self.memory)
    }

    fn build_messages(&self, ephemeral_context: Option<&str>) -> Vec<ChatMessage> {
        let memory = lock(&self.memory);
        let history = memory.recent(self.history_window);
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::new(ChatRole::System, self.system_prompt.clone()));
        if let Some(context) = ephemeral_context.map(str::trim).filter(|c| !c.is_empty()) {
            messages.push(ChatMessage::new(ChatRole::System, context));
        }
        messages.extend(history.iter().cloned());
        messages
    }
}

#[async_trait]
impl<C: ChatClient> ReplyGenerator for ConversationService<C> {
    async fn prepare_reply(
        &self,
        user_text: &str,
        ephemeral_context: Option<&str>,
    ) -> Result<String> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Err(SpeechError::Validation("empty user text".into()));
        }

        lock(&self.memory).add_user(user_text);
        let messages = self.build_messages(ephemeral_context);
        debug!("requesting reply with {} messages", messages.len());

        let reply = self.chat.complete_messages(&messages).await?;
        Ok(reply.trim().to_owned())
    }

    fn commit_assistant_reply(&self, text: &str) {
        lock(&self.memory).add_assistant(text);
    }
}
