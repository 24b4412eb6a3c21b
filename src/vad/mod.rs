//! Voice activity detection using mean-absolute energy.
//!
//! [`NoiseCalibrator`] measures ambient noise over a short window and derives
//! the speech threshold. [`EnergyVad`] then splits fixed-size chunks into
//! utterances closed by a run of silent chunks.

use crate::config::VadConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::{AudioChunk, Utterance};
use std::time::Instant;
use tracing::{debug, info};

/// Mean absolute amplitude of a chunk.
pub fn mean_abs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

/// Number of samples in one detection chunk.
pub fn chunk_samples(config: &VadConfig, sample_rate: u32) -> usize {
    ((u64::from(sample_rate) * u64::from(config.chunk_duration_ms)) / 1000).max(1) as usize
}

/// Accumulates per-chunk noise levels for one calibration window.
#[derive(Debug)]
pub struct NoiseCalibrator {
    levels: Vec<f32>,
    chunks_needed: usize,
    multiplier: f32,
}

impl NoiseCalibrator {
    pub fn new(config: &VadConfig) -> Self {
        let chunks_needed = if config.chunk_duration_ms == 0 {
            0
        } else {
            (config.calibration_duration_ms / config.chunk_duration_ms) as usize
        };
        Self {
            levels: Vec::with_capacity(chunks_needed),
            chunks_needed,
            multiplier: config.noise_threshold_multiplier,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.levels.push(mean_abs(samples));
    }

    pub fn is_complete(&self) -> bool {
        self.levels.len() >= self.chunks_needed
    }

    /// Threshold = mean noise level × multiplier.
    ///
    /// # Errors
    ///
    /// Returns a VAD error if no chunk was measured.
    pub fn finish(self) -> Result<f32> {
        if self.levels.is_empty() {
            return Err(SpeechError::Vad(
                "noise calibration collected no audio".into(),
            ));
        }
        let noise = self.levels.iter().sum::<f32>() / self.levels.len() as f32;
        Ok(noise * self.multiplier)
    }
}

/// Output of [`EnergyVad::process_chunk`].
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// First loud chunk of a new utterance.
    SpeechStart,
    /// Silence gap reached; the utterance is complete.
    Utterance(Utterance),
}

/// Energy-threshold utterance segmenter.
pub struct EnergyVad {
    threshold: f32,
    silence_chunks_needed: u32,
    silence_count: u32,
    in_speech: bool,
    frames: Vec<f32>,
    speech_start: Option<Instant>,
    sample_rate: u32,
}

impl EnergyVad {
    /// Create a detector with the given threshold. An utterance closes after
    /// `silence_duration_ms` worth of consecutive quiet chunks.
    pub fn new(config: &VadConfig, sample_rate: u32, threshold: f32) -> Self {
        let chunk_ms = config.chunk_duration_ms.max(1);
        let silence_chunks_needed = config.silence_duration_ms.div_ceil(chunk_ms).max(1);
        info!(
            "VAD initialized: threshold={threshold:.5}, silence={} chunks",
            silence_chunks_needed
        );
        Self {
            threshold,
            silence_chunks_needed,
            silence_count: 0,
            in_speech: false,
            frames: Vec::new(),
            speech_start: None,
            sample_rate,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn process_chunk(&mut self, chunk: &AudioChunk) -> Option<VadEvent> {
        let loud = mean_abs(&chunk.samples) >= self.threshold;

        if loud {
            self.silence_count = 0;
            self.frames.extend_from_slice(&chunk.samples);
            if !self.in_speech {
                self.in_speech = true;
                self.speech_start = Some(chunk.captured_at);
                debug!("speech started");
                return Some(VadEvent::SpeechStart);
            }
            return None;
        }

        if !self.in_speech {
            return None;
        }

        self.silence_count += 1;
        self.frames.extend_from_slice(&chunk.samples);
        if self.silence_count >= self.silence_chunks_needed {
            return self.take_utterance().map(VadEvent::Utterance);
        }
        None
    }

    /// Return the partial utterance, if speech is in progress.
    pub fn flush(&mut self) -> Option<Utterance> {
        if self.in_speech {
            self.take_utterance()
        } else {
            self.reset();
            None
        }
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.in_speech = false;
        self.silence_count = 0;
        self.speech_start = None;
    }

    fn take_utterance(&mut self) -> Option<Utterance> {
        let samples = std::mem::take(&mut self.frames);
        let started_at = self.speech_start.take().unwrap_or_else(Instant::now);
        self.in_speech = false;
        self.silence_count = 0;
        if samples.is_empty() {
            return None;
        }
        Some(Utterance {
            samples,
            sample_rate: self.sample_rate,
            started_at,
        })
    }
}
