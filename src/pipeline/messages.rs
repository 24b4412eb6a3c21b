//! Message types passed between pipeline stages.

use std::time::Instant;

/// A chunk of raw audio samples from the microphone.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples at the configured input sample rate.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp when this chunk was captured.
    pub captured_at: Instant,
}

/// One captured speech segment, closed by a silence gap.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Concatenated audio samples for the entire utterance.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the speech segment started.
    pub started_at: Instant,
}

impl Utterance {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            started_at: Instant::now(),
        }
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// A reply-generation request issued for a wake-gated transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Strictly increasing per process lifetime.
    pub id: u64,
    /// Whether the user barged in on the previous reply.
    pub interrupted: bool,
    /// Text of the reply that was cut off, if still within its TTL.
    pub interrupted_context: Option<String>,
}

/// A generated reply waiting for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyItem {
    pub request_id: u64,
    pub text: String,
}

/// Synthesized audio from TTS, ready for playback.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// f32 audio samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}
