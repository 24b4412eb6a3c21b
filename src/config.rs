//! Configuration types for the voice conversation pipeline.

use crate::error::{Result, SpeechError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the conversation pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Utterance segmentation and noise calibration.
    pub vad: VadConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Reply generation settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Short-term conversation memory.
    pub memory: MemoryConfig,
    /// Wake phrases and idle sleep.
    pub conversation: ConversationConfig,
    /// Barge-in (interrupt) behavior while the assistant is speaking.
    pub barge_in: BargeInConfig,
    /// Turn concurrency and queue sizing.
    pub pipeline: PipelineConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input sample rate in Hz.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz.
    pub output_sample_rate: u32,
    /// Number of input channels (1 = mono).
    pub input_channels: u16,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Silence written before each reply to avoid start-up clicks (ms).
    pub prime_silence_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            input_channels: 1,
            input_device: None,
            output_device: None,
            prime_silence_ms: 200,
        }
    }
}

/// Utterance segmentation configuration.
///
/// The threshold is not configured directly: it is measured from ambient
/// noise at start-up (and on recalibration) and scaled by
/// `noise_threshold_multiplier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Analysis chunk length in ms.
    pub chunk_duration_ms: u32,
    /// Trailing silence that closes an utterance, in ms.
    pub silence_duration_ms: u32,
    /// Length of the ambient noise measurement window, in ms.
    pub calibration_duration_ms: u32,
    /// Speech threshold = mean ambient level × this multiplier.
    pub noise_threshold_multiplier: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: 100,
            silence_duration_ms: 1500,
            calibration_duration_ms: 1000,
            noise_threshold_multiplier: 3.0,
        }
    }
}

/// Which speech-to-text backend transcribes utterances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// OpenAI-compatible `/v1/audio/transcriptions` endpoint.
    #[default]
    OpenAi,
    /// On-device whisper.cpp model (requires the `whisper` feature).
    Local,
}

impl std::str::FromStr for SttProvider {
    type Err = SpeechError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "local" => Ok(Self::Local),
            other => Err(SpeechError::Config(format!(
                "unknown STT provider '{other}' (expected 'openai' or 'local')"
            ))),
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Backend used for transcription.
    pub provider: SttProvider,
    /// Transcription model requested from the API.
    pub model: String,
    /// Optional ISO-639-1 language hint.
    pub language: Option<String>,
    /// GGML model file for the local provider.
    pub model_path: Option<PathBuf>,
    /// Inference threads for the local provider. 0 lets whisper.cpp decide.
    pub threads: u32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: SttProvider::OpenAi,
            model: "whisper-1".to_owned(),
            language: None,
            model_path: None,
            threads: 0,
        }
    }
}

impl SttConfig {
    fn validate(&self) -> Result<()> {
        if self.provider == SttProvider::Local && self.model_path.is_none() {
            return Err(SpeechError::Config(
                "stt.model_path is required when stt.provider = \"local\"".into(),
            ));
        }
        Ok(())
    }
}

/// Default persona used when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are My English Buddy. Answer in clear, friendly English. \
     Keep replies short enough to be spoken aloud. \
     If the user writes Japanese, you may include short Japanese hints.";

/// Reply generation configuration (OpenAI-compatible API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the API server.
    pub api_url: String,
    /// Model name to request from the API.
    pub api_model: String,
    /// API key sent as a bearer token. Empty for local servers.
    pub api_key: String,
    /// Request timeout in seconds, shared by the chat, STT and TTS clients.
    pub timeout_secs: f64,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum tokens to generate per reply.
    pub max_tokens: usize,
    /// Number of recent memory messages sent with each request.
    pub history_window: usize,
    /// Optional system prompt override.
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            api_model: "gpt-4o-mini".to_owned(),
            api_key: String::new(),
            timeout_secs: 60.0,
            temperature: 0.7,
            max_tokens: 512,
            history_window: 12,
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    /// Returns the configured system prompt, or the default persona.
    pub fn effective_system_prompt(&self) -> String {
        match self.system_prompt.as_deref().map(str::trim) {
            Some(prompt) if !prompt.is_empty() => prompt.to_owned(),
            _ => DEFAULT_SYSTEM_PROMPT.to_owned(),
        }
    }

    /// Request timeout as a [`Duration`].
    ///
    /// # Errors
    ///
    /// Returns a config error unless `timeout_secs` is finite, positive and
    /// representable as a [`Duration`].
    pub fn timeout(&self) -> Result<Duration> {
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(SpeechError::Config(format!(
                "llm.timeout_secs must be a positive number of seconds, got {}",
                self.timeout_secs
            )));
        }
        Duration::try_from_secs_f64(self.timeout_secs).map_err(|e| {
            SpeechError::Config(format!(
                "llm.timeout_secs {} is out of range: {e}",
                self.timeout_secs
            ))
        })
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Speech model requested from the API.
    pub model: String,
    /// Voice name.
    pub voice: String,
    /// Speaking speed multiplier.
    pub speed: f32,
    /// Sample rate of the returned PCM stream in Hz.
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini-tts".to_owned(),
            voice: "alloy".to_owned(),
            speed: 1.0,
            sample_rate: 24_000,
        }
    }
}

/// Short-term conversation memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum retained messages. `None` keeps everything.
    pub max_messages: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: Some(200),
        }
    }
}

/// Wake phrase and idle-sleep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Phrases that wake the assistant (case-insensitive substring match).
    pub wake_phrases: Vec<String>,
    /// Seconds without activity before the assistant goes back to sleep.
    ///
    /// Set to 0 to disable the idle watchdog.
    pub idle_timeout_s: u64,
    /// Watchdog poll interval in ms.
    pub watchdog_poll_ms: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            wake_phrases: vec!["hey buddy".to_owned(), "buddy".to_owned()],
            idle_timeout_s: 180,
            watchdog_poll_ms: 1000,
        }
    }
}

/// Barge-in configuration (user interrupts assistant by speaking).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether speech-start during playback cancels playback.
    pub enabled: bool,
    /// How long the cut-off reply stays available to the next turn (seconds).
    pub interrupted_context_ttl_s: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interrupted_context_ttl_s: 30,
        }
    }
}

/// Turn concurrency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum turns in transcription/generation at once.
    pub max_concurrent_turns: usize,
    /// Captured utterances buffered before the oldest is dropped.
    pub utterance_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_turns: 2,
            utterance_queue_capacity: 8,
        }
    }
}

impl SpeechConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| SpeechError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SpeechError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/buddy/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("buddy").join("config.toml")
        } else if let Some(dir) = dirs::config_dir() {
            dir.join("buddy").join("config.toml")
        } else {
            PathBuf::from("/tmp/buddy-config/config.toml")
        }
    }

    /// Apply `OPENAI_*` and `BUDDY_STT_*` overrides from the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_TIMEOUT_SECONDS` is not a number.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Empty values are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_TIMEOUT_SECONDS` is not a positive finite
    /// number or `BUDDY_STT_PROVIDER` names an unknown backend.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("OPENAI_API_KEY") {
            self.llm.api_key = key;
        }
        if let Some(model) = get("OPENAI_MODEL") {
            self.llm.api_model = model;
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.llm.api_url = url;
        }
        if let Some(raw) = get("OPENAI_TIMEOUT_SECONDS") {
            let secs = raw.trim().parse::<f64>().map_err(|_| {
                SpeechError::Config("OPENAI_TIMEOUT_SECONDS must be a number (seconds)".into())
            })?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(SpeechError::Config(format!(
                    "OPENAI_TIMEOUT_SECONDS must be a positive finite number, got {raw}"
                )));
            }
            self.llm.timeout_secs = secs;
        }
        if let Some(provider) = get("BUDDY_STT_PROVIDER") {
            self.stt.provider = provider.parse()?;
        }
        if let Some(path) = get("BUDDY_STT_MODEL_PATH") {
            self.stt.model_path = Some(PathBuf::from(path.trim()));
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_concurrent_turns == 0 {
            return Err(SpeechError::Config(
                "pipeline.max_concurrent_turns must be at least 1".into(),
            ));
        }
        if self.pipeline.utterance_queue_capacity == 0 {
            return Err(SpeechError::Config(
                "pipeline.utterance_queue_capacity must be at least 1".into(),
            ));
        }
        if self
            .conversation
            .wake_phrases
            .iter()
            .all(|p| p.trim().is_empty())
        {
            return Err(SpeechError::Config(
                "conversation.wake_phrases must contain a phrase".into(),
            ));
        }
        if self.conversation.watchdog_poll_ms == 0 {
            return Err(SpeechError::Config(
                "conversation.watchdog_poll_ms must be positive".into(),
            ));
        }
        if self.vad.chunk_duration_ms == 0 {
            return Err(SpeechError::Config(
                "vad.chunk_duration_ms must be positive".into(),
            ));
        }
        self.llm.timeout()?;
        self.stt.validate()?;
        Ok(())
    }
}
