//! Speech-to-text.
//!
//! [`OpenAiSpeechToText`] encodes the utterance as 16-bit WAV with `hound`
//! and posts it to an OpenAI-compatible `/v1/audio/transcriptions` endpoint.
//! With the `whisper` feature, `local::WhisperSpeechToText` runs a GGML
//! model on-device instead.

#[cfg(feature = "whisper")]
pub mod local;

use crate::config::{LlmConfig, SttConfig, SttProvider};
use crate::error::{Result, SpeechError};
use crate::llm::api::{api_endpoint, build_http_client, with_auth};
use crate::pipeline::messages::Utterance;
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Transcribes one captured utterance.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Returns the transcript; may be empty when nothing intelligible was said.
    async fn transcribe(&self, utterance: &Utterance) -> Result<String>;
}

/// Build the backend selected by `stt.provider`.
///
/// # Errors
///
/// Returns a config error when the local provider is selected but this build
/// lacks the `whisper` feature, or the backend fails to initialise.
pub fn from_config(
    http: reqwest::Client,
    config: &SttConfig,
    llm: &LlmConfig,
) -> Result<Arc<dyn SpeechToText>> {
    match config.provider {
        SttProvider::OpenAi => Ok(Arc::new(OpenAiSpeechToText::with_client(
            http, config, llm,
        ))),
        #[cfg(feature = "whisper")]
        SttProvider::Local => Ok(Arc::new(local::WhisperSpeechToText::new(config)?)),
        #[cfg(not(feature = "whisper"))]
        SttProvider::Local => Err(SpeechError::Config(
            "stt.provider = \"local\" requires building with --features whisper".into(),
        )),
    }
}

/// Transcription through an OpenAI-compatible API.
pub struct OpenAiSpeechToText {
    http: reqwest::Client,
    url: String,
    model: String,
    language: Option<String>,
    api_key: String,
}

impl OpenAiSpeechToText {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &SttConfig, llm: &LlmConfig) -> Result<Self> {
        Ok(Self::with_client(build_http_client(llm)?, config, llm))
    }

    pub fn with_client(http: reqwest::Client, config: &SttConfig, llm: &LlmConfig) -> Self {
        let url = api_endpoint(&llm.api_url, "audio/transcriptions");
        info!("STT configured: {url} model={}", config.model);
        Self {
            http,
            url,
            model: config.model.clone(),
            language: config.language.clone(),
            api_key: llm.api_key.clone(),
        }
    }
}

#[async_trait]
impl SpeechToText for OpenAiSpeechToText {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String> {
        let started = Instant::now();
        let wav = encode_wav(&utterance.samples, utterance.sample_rate)?;

        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| SpeechError::Stt(format!("invalid upload part: {e}")))?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", file);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = with_auth(self.http.post(&self.url), &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SpeechError::Stt(format!("transcription request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SpeechError::Stt(format!(
                "transcription returned {status}: {detail}"
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SpeechError::Stt(format!("invalid transcription response: {e}")))?;
        let text = value["text"].as_str().unwrap_or_default().trim().to_owned();

        info!(
            "transcribed {:.1}s of audio in {:.2}s",
            utterance.duration_secs(),
            started.elapsed().as_secs_f64()
        );
        Ok(text)
    }
}

/// Encode mono f32 samples as a 16-bit PCM WAV file in memory.
fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buffer, spec)
            .map_err(|e| SpeechError::Stt(format!("WAV encode failed: {e}")))?;
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(value)
                .map_err(|e| SpeechError::Stt(format!("WAV encode failed: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| SpeechError::Stt(format!("WAV encode failed: {e}")))?;
    }
    Ok(buffer.into_inner())
}
