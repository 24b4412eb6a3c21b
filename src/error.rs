//! Error types for the buddy pipeline.

/// Top-level error type for the voice conversation system.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection or noise calibration error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Reply generation (chat completion) error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Empty or whitespace-only text where content was required.
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used when deciding how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A transcription, generation, or synthesis call failed.
    ExternalService,
    /// Audio device, runtime, or filesystem failure.
    LocalResource,
    /// Empty or whitespace text at some stage.
    Validation,
}

impl SpeechError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Stt(_) | Self::Llm(_) | Self::Tts(_) => ErrorKind::ExternalService,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Audio(_)
            | Self::Vad(_)
            | Self::Config(_)
            | Self::Pipeline(_)
            | Self::Io(_) => ErrorKind::LocalResource,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;
