//! Runtime events emitted by the pipeline for UI and observability.
//!
//! Events are sent on a `tokio::sync::broadcast` channel. Sending never
//! blocks and a missing or lagging subscriber never affects the pipeline.

use tokio::sync::broadcast;

/// Events that describe what the pipeline is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Human-readable log line for presentation layers.
    Log { message: String },
    /// Ambient noise measurement started.
    CalibrationStarted,
    /// Ambient noise measurement finished with the resulting speech threshold.
    CalibrationFinished { threshold: f32 },
    /// Noise calibration failed.
    CalibrationFailed { message: String },
    /// Wake phrase detected; the assistant is listening.
    Awake,
    /// Idle timeout elapsed; the assistant went back to sleep.
    Asleep,
    /// User transcript produced by STT.
    UserTranscript { text: String },
    /// Assistant reply queued for playback.
    AssistantReply { request_id: u64, text: String },
    /// Reply playback finished and was committed to memory.
    PlaybackCompleted { request_id: u64 },
    /// Reply playback was cut short by the user.
    PlaybackInterrupted { request_id: u64 },
}

/// Optional broadcaster shared by pipeline stages.
pub type RuntimeSender = Option<broadcast::Sender<RuntimeEvent>>;

/// Send `event` if a broadcaster is attached. Errors (no receivers) are ignored.
pub fn emit(tx: &RuntimeSender, event: RuntimeEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

/// Log `message` through `tracing` and forward it as [`RuntimeEvent::Log`].
pub fn emit_log(tx: &RuntimeSender, message: impl Into<String>) {
    let message = message.into();
    tracing::info!("{message}");
    emit(tx, RuntimeEvent::Log { message });
}
