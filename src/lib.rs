//! Buddy: a voice conversation loop with barge-in.
//!
//! Microphone → VAD → STT → wake gate → reply generation → TTS → speaker
//!
//! # Architecture
//!
//! The interesting part is turn-taking, not the individual stages:
//! - **Listener**: captures audio via `cpal` and segments utterances with an
//!   energy VAD on its own thread
//! - **Dispatcher**: runs at most K turn workers at once
//! - **Turn workers**: transcribe, apply the wake gate, generate a reply and
//!   publish it only if no newer request exists
//! - **Speaker loop**: plays the single queued reply, stops the moment the
//!   user talks over it, and commits to memory only what was heard in full
//! - **Sleep watchdog**: returns an idle session to wake-phrase mode
//!
//! All shared state lives in [`pipeline::session::Session`].

pub mod audio;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod runtime;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod wakeword;

pub use config::SpeechConfig;
pub use error::{ErrorKind, Result, SpeechError};
pub use llm::{ChatClient, ConversationService, ReplyGenerator};
pub use memory::MemoryService;
pub use pipeline::coordinator::ConversationRunner;
pub use runtime::RuntimeEvent;
