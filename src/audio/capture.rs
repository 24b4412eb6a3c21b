//! Microphone capture and utterance segmentation.
//!
//! [`CpalListener`] runs a dedicated OS thread that owns the cpal input
//! stream (cpal streams are `!Send`). The stream callback converts to mono,
//! resamples to the pipeline rate, and hands buffers to the thread over a
//! `crossbeam-channel`. The thread cuts them into fixed-size chunks and
//! drives noise calibration and the energy VAD, pushing finished utterances
//! into the [`UtteranceQueue`].

use crate::audio::resample;
use crate::config::{AudioConfig, VadConfig};
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::{AudioChunk, Utterance};
use crate::pipeline::queues::{PushOutcome, UtteranceQueue};
use crate::runtime::{RuntimeEvent, RuntimeSender, emit};
use crate::vad::{EnergyVad, NoiseCalibrator, VadEvent, chunk_samples};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the capture thread re-checks the cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Callbacks the listener invokes from its capture thread.
#[derive(Clone)]
pub struct ListenerHooks {
    /// Called on the first loud chunk of every utterance. Must not block.
    pub on_speech_start: Arc<dyn Fn() + Send + Sync>,
    /// Calibration progress is reported here.
    pub events: RuntimeSender,
}

impl ListenerHooks {
    pub fn new(on_speech_start: Arc<dyn Fn() + Send + Sync>, events: RuntimeSender) -> Self {
        Self {
            on_speech_start,
            events,
        }
    }

    /// Hooks that ignore everything.
    pub fn noop() -> Self {
        Self::new(Arc::new(|| {}), None)
    }
}

/// Keeps a listener's capture thread joinable.
#[derive(Debug, Default)]
pub struct ListenerHandle {
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn from_thread(thread: JoinHandle<()>) -> Self {
        Self {
            thread: Some(thread),
        }
    }

    /// A handle with nothing to join (listeners driven by another task).
    pub fn detached() -> Self {
        Self::default()
    }

    /// Block until the capture thread exits.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("listener thread panicked");
            }
        }
    }
}

/// Produces utterances until `cancel` fires.
pub trait UtteranceListener: Send + Sync {
    /// Start capturing. Finished utterances go to `queue` with drop-oldest
    /// overflow; `hooks.on_speech_start` fires as speech begins.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture device cannot be opened.
    fn start(
        &self,
        queue: UtteranceQueue,
        cancel: CancellationToken,
        hooks: ListenerHooks,
    ) -> Result<ListenerHandle>;

    /// Ask for a fresh noise calibration. Performed the next time no
    /// utterance is in progress.
    fn request_recalibration(&self);
}

/// Outcome of feeding one chunk to the [`Segmenter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Chunking, calibration and VAD state for one listening session.
pub(crate) struct Segmenter {
    vad_config: VadConfig,
    sample_rate: u32,
    chunk_len: usize,
    pending: Vec<f32>,
    calibrator: Option<NoiseCalibrator>,
    vad: Option<EnergyVad>,
    recalibrate: Arc<AtomicBool>,
    queue: UtteranceQueue,
    hooks: ListenerHooks,
}

impl Segmenter {
    pub(crate) fn new(
        vad_config: &VadConfig,
        sample_rate: u32,
        recalibrate: Arc<AtomicBool>,
        queue: UtteranceQueue,
        hooks: ListenerHooks,
    ) -> Self {
        Self {
            vad_config: vad_config.clone(),
            sample_rate,
            chunk_len: chunk_samples(vad_config, sample_rate),
            pending: Vec::new(),
            calibrator: None,
            vad: None,
            recalibrate,
            queue,
            hooks,
        }
    }

    /// Begin the initial calibration.
    pub(crate) fn start(&mut self) -> Flow {
        self.begin_calibration()
    }

    /// Append captured samples and process every complete chunk.
    pub(crate) fn feed(&mut self, samples: &[f32]) -> Flow {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.chunk_len {
            let rest = self.pending.split_off(self.chunk_len);
            let chunk = AudioChunk {
                samples: std::mem::replace(&mut self.pending, rest),
                sample_rate: self.sample_rate,
                captured_at: Instant::now(),
            };
            if self.handle_chunk(&chunk) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Flush a partial utterance on stop.
    pub(crate) fn finish(&mut self) {
        if let Some(utterance) = self.vad.as_mut().and_then(EnergyVad::flush) {
            debug!(
                "flushing partial utterance ({:.1}s)",
                utterance.duration_secs()
            );
            self.push(utterance);
        }
    }

    fn handle_chunk(&mut self, chunk: &AudioChunk) -> Flow {
        let idle = self.vad.as_ref().is_none_or(|vad| !vad.in_speech());
        if self.calibrator.is_none()
            && idle
            && self.recalibrate.swap(false, Ordering::SeqCst)
            && self.begin_calibration() == Flow::Stop
        {
            return Flow::Stop;
        }

        if let Some(calibrator) = self.calibrator.as_mut() {
            calibrator.push(&chunk.samples);
            if calibrator.is_complete() {
                return self.conclude_calibration();
            }
            return Flow::Continue;
        }

        let Some(vad) = self.vad.as_mut() else {
            return Flow::Continue;
        };
        match vad.process_chunk(chunk) {
            Some(VadEvent::SpeechStart) => (self.hooks.on_speech_start)(),
            Some(VadEvent::Utterance(utterance)) => self.push(utterance),
            None => {}
        }
        Flow::Continue
    }

    fn begin_calibration(&mut self) -> Flow {
        info!("calibrating noise level");
        emit(&self.hooks.events, RuntimeEvent::CalibrationStarted);
        let calibrator = NoiseCalibrator::new(&self.vad_config);
        let complete = calibrator.is_complete();
        self.calibrator = Some(calibrator);
        if complete {
            return self.conclude_calibration();
        }
        Flow::Continue
    }

    fn conclude_calibration(&mut self) -> Flow {
        let Some(calibrator) = self.calibrator.take() else {
            return Flow::Continue;
        };
        match calibrator.finish() {
            Ok(threshold) => {
                info!("noise calibration done: threshold={threshold:.5}");
                match self.vad.as_mut() {
                    Some(vad) => vad.set_threshold(threshold),
                    None => {
                        self.vad = Some(EnergyVad::new(
                            &self.vad_config,
                            self.sample_rate,
                            threshold,
                        ));
                    }
                }
                emit(
                    &self.hooks.events,
                    RuntimeEvent::CalibrationFinished { threshold },
                );
                Flow::Continue
            }
            Err(e) => {
                warn!("noise calibration failed: {e}");
                emit(
                    &self.hooks.events,
                    RuntimeEvent::CalibrationFailed {
                        message: e.to_string(),
                    },
                );
                // Without a first threshold there is nothing to listen with.
                if self.vad.is_none() {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
        }
    }

    fn push(&self, utterance: Utterance) {
        if self.queue.push(utterance) == PushOutcome::DroppedOldest {
            warn!("utterance queue full, dropped oldest utterance");
        }
    }
}

/// Microphone listener backed by cpal.
pub struct CpalListener {
    audio: AudioConfig,
    vad: VadConfig,
    recalibrate: Arc<AtomicBool>,
}

impl CpalListener {
    pub fn new(audio: &AudioConfig, vad: &VadConfig) -> Self {
        Self {
            audio: audio.clone(),
            vad: vad.clone(),
            recalibrate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
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

impl UtteranceListener for CpalListener {
    fn start(
        &self,
        queue: UtteranceQueue,
        cancel: CancellationToken,
        hooks: ListenerHooks,
    ) -> Result<ListenerHandle> {
        let audio = self.audio.clone();
        let mut segmenter = Segmenter::new(
            &self.vad,
            self.audio.input_sample_rate,
            Arc::clone(&self.recalibrate),
            queue,
            hooks,
        );
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let thread = std::thread::Builder::new()
            .name("buddy-capture".into())
            .spawn(move || {
                let (tx, rx) = crossbeam_channel::bounded::<Vec<f32>>(64);
                let stream = match open_input_stream(&audio, tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if segmenter.start() == Flow::Continue {
                    listen_loop(&mut segmenter, &rx, &cancel);
                } else {
                    cancel.cancel();
                }
                drop(stream);
                segmenter.finish();
                info!("audio capture stopped");
            })
            .map_err(|e| SpeechError::Audio(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(ListenerHandle::from_thread(thread)),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(SpeechError::Audio(
                "capture thread exited during startup".into(),
            )),
        }
    }

    fn request_recalibration(&self) {
        self.recalibrate.store(true, Ordering::SeqCst);
    }
}

fn listen_loop(segmenter: &mut Segmenter, rx: &Receiver<Vec<f32>>, cancel: &CancellationToken) {
    while !cancel.is_cancelled() {
        match rx.recv_timeout(CANCEL_POLL) {
            Ok(samples) => {
                if segmenter.feed(&samples) == Flow::Stop {
                    cancel.cancel();
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("audio input stream closed");
                break;
            }
        }
    }
}

/// Open the input device and start a stream feeding `tx`.
fn open_input_stream(config: &AudioConfig, tx: Sender<Vec<f32>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.input_device {
        host.input_devices()
            .map_err(|e| SpeechError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SpeechError::Audio(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| SpeechError::Audio("no default input device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_name}");

    let default_config = device
        .default_input_config()
        .map_err(|e| SpeechError::Audio(format!("no default input config: {e}")))?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let target_rate = config.input_sample_rate;

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let samples = resample(&mono, native_rate, target_rate);
                // Never block the audio thread.
                if tx.try_send(samples).is_err() {
                    debug!("capture channel full, dropping buffer");
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| SpeechError::Audio(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SpeechError::Audio(format!("failed to start input stream: {e}")))?;

    info!("audio capture started: native {native_rate}Hz/{native_channels}ch -> {target_rate}Hz mono");
    Ok(stream)
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}
