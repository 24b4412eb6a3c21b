//! Audio playback to system speakers via cpal.

use crate::audio::resample;
use crate::config::AudioConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::SynthesizedAudio;
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Plays synthesized audio, stopping early when `cancel` is set.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Returns `true` if every sample was played, `false` if cut short.
    async fn play(&self, audio: SynthesizedAudio, cancel: Arc<AtomicBool>) -> Result<bool>;
}

/// Speaker output through cpal.
///
/// The device is opened per reply on a blocking thread, so a changed default
/// output device is picked up on the next reply.
pub struct CpalPlayback {
    config: AudioConfig,
}

impl CpalPlayback {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| SpeechError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl AudioSink for CpalPlayback {
    async fn play(&self, audio: SynthesizedAudio, cancel: Arc<AtomicBool>) -> Result<bool> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || play_blocking(&config, &audio, &cancel))
            .await
            .map_err(|e| SpeechError::Audio(format!("playback task failed: {e}")))?
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

/// Leading silence plus the reply, resampled to the device rate.
fn prepare_samples(config: &AudioConfig, audio: &SynthesizedAudio) -> Vec<f32> {
    let rate = config.output_sample_rate;
    let prime = (u64::from(rate) * u64::from(config.prime_silence_ms) / 1000) as usize;
    let body = resample(&audio.samples, audio.sample_rate, rate);
    let mut samples = Vec::with_capacity(prime + body.len());
    samples.resize(prime, 0.0);
    samples.extend(body);
    samples
}

fn open_output_device(config: &AudioConfig) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let device = if let Some(ref name) = config.output_device {
        host.output_devices()
            .map_err(|e| SpeechError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SpeechError::Audio(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| SpeechError::Audio("no default output device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    debug!("using output device: {device_name}");
    Ok(device)
}

/// `Some(completed)` once playback is over. A fully drained buffer counts as
/// completed even if the cancel flag was raised after the last sample.
fn poll_outcome(finished: bool, cancelled: bool) -> Option<bool> {
    if finished {
        Some(true)
    } else if cancelled {
        Some(false)
    } else {
        None
    }
}

fn play_blocking(
    config: &AudioConfig,
    audio: &SynthesizedAudio,
    cancel: &Arc<AtomicBool>,
) -> Result<bool> {
    if cancel.load(Ordering::SeqCst) {
        return Ok(false);
    }

    let device = open_output_device(config)?;
    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: config.output_sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples: prepare_samples(config, audio),
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);
    let cancel_clone = Arc::clone(cancel);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let Ok(mut buf) = buffer_clone.lock() else {
                    return;
                };
                let cancelled = cancel_clone.load(Ordering::Relaxed);
                for sample in data.iter_mut() {
                    if !cancelled && buf.position < buf.samples.len() {
                        *sample = buf.samples[buf.position];
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                    }
                }
                if buf.position >= buf.samples.len() {
                    buf.finished = true;
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SpeechError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SpeechError::Audio(format!("failed to start output stream: {e}")))?;

    let completed = loop {
        std::thread::sleep(POLL_INTERVAL);
        let finished = buffer
            .lock()
            .map_err(|e| SpeechError::Audio(format!("playback buffer lock poisoned: {e}")))?
            .finished;
        if let Some(completed) = poll_outcome(finished, cancel.load(Ordering::SeqCst)) {
            if !completed {
                info!("playback interrupted");
            }
            break completed;
        }
    };

    drop(stream);
    Ok(completed)
}
