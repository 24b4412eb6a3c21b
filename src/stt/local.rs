//! On-device transcription with whisper.cpp via `whisper-rs`.

use crate::audio::resample;
use crate::config::SttConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::Utterance;
use crate::stt::SpeechToText;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// whisper.cpp only accepts 16 kHz mono input.
const WHISPER_SAMPLE_RATE: u32 = 16_000;

/// Transcription with a GGML whisper model loaded from disk.
pub struct WhisperSpeechToText {
    context: Arc<WhisperContext>,
    language: Option<String>,
    threads: u32,
}

impl WhisperSpeechToText {
    /// Load the model named by `stt.model_path`.
    ///
    /// # Errors
    ///
    /// Returns an STT error if no model path is configured, the file is
    /// missing, or whisper.cpp cannot load it.
    pub fn new(config: &SttConfig) -> Result<Self> {
        let path = config.model_path.as_deref().ok_or_else(|| {
            SpeechError::Config("stt.model_path is required for the local provider".into())
        })?;
        let context = load_context(path)?;
        Ok(Self {
            context: Arc::new(context),
            language: config.language.clone(),
            threads: config.threads,
        })
    }
}

fn load_context(path: &Path) -> Result<WhisperContext> {
    if !path.exists() {
        return Err(SpeechError::Stt(format!(
            "whisper model not found: {}",
            path.display()
        )));
    }
    let path_str = path
        .to_str()
        .ok_or_else(|| SpeechError::Stt(format!("invalid model path: {}", path.display())))?;

    info!("loading whisper model from {}", path.display());
    let started = Instant::now();
    let context = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
        .map_err(|e| SpeechError::Stt(format!("whisper model load failed: {e}")))?;
    info!(
        "whisper model loaded in {:.2}s",
        started.elapsed().as_secs_f64()
    );
    Ok(context)
}

#[async_trait]
impl SpeechToText for WhisperSpeechToText {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String> {
        if utterance.samples.is_empty() {
            return Ok(String::new());
        }

        let audio: Vec<f32> = resample(
            &utterance.samples,
            utterance.sample_rate,
            WHISPER_SAMPLE_RATE,
        )
        .into_iter()
        .map(|s| s.clamp(-1.0, 1.0))
        .collect();
        let context = Arc::clone(&self.context);
        let language = self.language.clone();
        let threads = self.threads;
        let duration = utterance.duration_secs();

        let started = Instant::now();
        let text = tokio::task::spawn_blocking(move || {
            run_inference(&context, &audio, language.as_deref(), threads)
        })
        .await
        .map_err(|e| SpeechError::Stt(format!("whisper task failed: {e}")))??;

        info!(
            "transcribed {duration:.1}s of audio locally in {:.2}s",
            started.elapsed().as_secs_f64()
        );
        Ok(text)
    }
}

fn run_inference(
    context: &WhisperContext,
    audio: &[f32],
    language: Option<&str>,
    threads: u32,
) -> Result<String> {
    let mut state = context
        .create_state()
        .map_err(|e| SpeechError::Stt(format!("whisper state init failed: {e}")))?;

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_language(Some(language.unwrap_or("en")));
    if threads > 0 {
        #[allow(clippy::cast_possible_wrap)]
        params.set_n_threads(threads as i32);
    }
    params.set_no_timestamps(true);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_special(false);

    state
        .full(params, audio)
        .map_err(|e| SpeechError::Stt(format!("whisper inference failed: {e}")))?;

    let segments = state.full_n_segments();
    let mut text = String::new();
    for i in 0..segments {
        if let Some(segment) = state.get_segment(i)
            && let Ok(segment_text) = segment.to_str()
        {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(segment_text.trim());
        }
    }
    debug!(segments, chars = text.len(), "whisper transcription complete");
    Ok(text.trim().to_owned())
}
