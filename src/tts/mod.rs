//! Text-to-speech synthesis.
//!
//! [`OpenAiTextToSpeech`] requests raw 16-bit little-endian PCM from an
//! OpenAI-compatible `/v1/audio/speech` endpoint and converts it to f32.

use crate::config::{LlmConfig, TtsConfig};
use crate::error::{Result, SpeechError};
use crate::llm::api::{api_endpoint, build_http_client, with_auth};
use crate::pipeline::messages::SynthesizedAudio;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, info};

/// Turns reply text into playable audio.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;
}

/// Speech synthesis through an OpenAI-compatible API.
pub struct OpenAiTextToSpeech {
    http: reqwest::Client,
    url: String,
    model: String,
    voice: String,
    speed: f32,
    sample_rate: u32,
    api_key: String,
}

impl OpenAiTextToSpeech {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &TtsConfig, llm: &LlmConfig) -> Result<Self> {
        Ok(Self::with_client(build_http_client(llm)?, config, llm))
    }

    pub fn with_client(http: reqwest::Client, config: &TtsConfig, llm: &LlmConfig) -> Self {
        let url = api_endpoint(&llm.api_url, "audio/speech");
        info!(
            "TTS configured: {url} model={} voice={}",
            config.model, config.voice
        );
        Self {
            http,
            url,
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
            sample_rate: config.sample_rate,
            api_key: llm.api_key.clone(),
        }
    }
}

#[async_trait]
impl TextToSpeech for OpenAiTextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SpeechError::Validation("nothing to synthesize".into()));
        }
        let started = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "speed": self.speed,
            "response_format": "pcm",
        });

        let response = with_auth(self.http.post(&self.url), &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Tts(format!("speech request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SpeechError::Tts(format!(
                "speech request returned {status}: {detail}"
            )));
        }

        let pcm = response
            .bytes()
            .await
            .map_err(|e| SpeechError::Tts(format!("failed to read speech audio: {e}")))?;
        let samples = pcm16le_to_f32(&pcm);

        debug!(
            "synthesized {} samples in {:.2}s",
            samples.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(SynthesizedAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// Decode signed 16-bit little-endian PCM. A trailing odd byte is ignored.
fn pcm16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / f32::from(i16::MAX))
        .collect()
}
