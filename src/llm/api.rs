//! OpenAI-compatible chat completions client.
//!
//! Works with any server implementing `/v1/chat/completions` (OpenAI,
//! Ollama, vLLM, llama.cpp server, ...). Also hosts the HTTP helpers shared
//! with the speech-to-text and text-to-speech clients.

use crate::config::LlmConfig;
use crate::error::{Result, SpeechError};
use crate::llm::ChatClient;
use crate::memory::ChatMessage;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, info};

/// Build the shared HTTP client with the configured request timeout.
///
/// # Errors
///
/// Returns a config error if the timeout is invalid or the TLS backend
/// cannot be initialised.
pub fn build_http_client(config: &LlmConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout()?)
        .build()
        .map_err(|e| SpeechError::Config(format!("failed to build HTTP client: {e}")))
}

/// Join a base URL (with or without a trailing `/v1`) and an API path.
pub fn api_endpoint(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    let path = path.trim_start_matches('/');
    format!("{base}/v1/{path}")
}

/// Attach the bearer token when one is configured.
pub(crate) fn with_auth(req: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        req
    } else {
        req.bearer_auth(api_key)
    }
}

/// Chat client for an OpenAI-compatible API.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    temperature: f64,
    max_tokens: usize,
}

impl OpenAiChatClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http = build_http_client(config)?;
        Ok(Self::with_client(http, config))
    }

    /// Reuse an existing HTTP client (shared connection pool).
    pub fn with_client(http: reqwest::Client, config: &LlmConfig) -> Self {
        let url = api_endpoint(&config.api_url, "chat/completions");
        info!("chat client configured: {url} model={}", config.api_model);
        Self {
            http,
            url,
            model: config.api_model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete_messages(&self, messages: &[ChatMessage]) -> Result<String> {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let started = Instant::now();
        let response = with_auth(self.http.post(&self.url), &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Llm(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SpeechError::Llm(format!(
                "chat request returned {status}: {detail}"
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SpeechError::Llm(format!("invalid chat response: {e}")))?;

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| SpeechError::Llm("chat response has no message content".into()))?;

        debug!(
            "chat completion took {:.2}s ({} chars)",
            started.elapsed().as_secs_f64(),
            content.len()
        );
        Ok(content.to_owned())
    }
}
