//! Turn-taking orchestrator that wires the pipeline together.
//!
//! ```text
//! listener ─▶ UtteranceQueue ─▶ dispatcher ─▶ ≤K turn workers ─▶ ReplyQueue ─▶ speaker loop
//!     │                                                                          │
//!     └──── speech start ──▶ Session (cancel playback, interrupt pending) ◀──────┘
//! ```
//!
//! Workers never cancel each other. Each reply carries its request id and is
//! dropped wherever it turns out not to be the latest one.

use crate::audio::{AudioSink, ListenerHandle, ListenerHooks, UtteranceListener};
use crate::config::SpeechConfig;
use crate::error::{Result, SpeechError};
use crate::llm::ReplyGenerator;
use crate::pipeline::messages::{ReplyItem, Request, Utterance};
use crate::pipeline::queues::{ReplyQueue, UtteranceQueue};
use crate::pipeline::session::{InterruptCapture, PublishOutcome, Session, TurnGuard};
use crate::runtime::{RuntimeEvent, RuntimeSender, emit, emit_log};
use crate::stt::SpeechToText;
use crate::tts::TextToSpeech;
use crate::wakeword::WakeGate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a turn worker needs, cloned into each spawned task.
#[derive(Clone)]
struct TurnContext {
    session: Session,
    replies: ReplyQueue,
    wake: Arc<WakeGate>,
    stt: Arc<dyn SpeechToText>,
    reply: Arc<dyn ReplyGenerator>,
    runtime_tx: RuntimeSender,
}

/// Everything the speaker loop needs.
struct SpeakerContext {
    session: Session,
    replies: ReplyQueue,
    reply: Arc<dyn ReplyGenerator>,
    tts: Arc<dyn TextToSpeech>,
    sink: Arc<dyn AudioSink>,
    runtime_tx: RuntimeSender,
}

/// How one reply left the speaker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpeakOutcome {
    Completed,
    Interrupted,
    Stale,
}

/// Runs the conversation: capture, bounded turn processing, playback.
pub struct ConversationRunner {
    config: SpeechConfig,
    cancel: CancellationToken,
    session: Session,
    utterances: UtteranceQueue,
    replies: ReplyQueue,
    limiter: Arc<Semaphore>,
    wake: Arc<WakeGate>,
    listener: Arc<dyn UtteranceListener>,
    stt: Arc<dyn SpeechToText>,
    reply: Arc<dyn ReplyGenerator>,
    tts: Arc<dyn TextToSpeech>,
    sink: Arc<dyn AudioSink>,
    runtime_tx: RuntimeSender,
}

impl ConversationRunner {
    pub fn new(
        config: SpeechConfig,
        listener: Arc<dyn UtteranceListener>,
        stt: Arc<dyn SpeechToText>,
        reply: Arc<dyn ReplyGenerator>,
        tts: Arc<dyn TextToSpeech>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let session = Session::new(Duration::from_secs(
            config.barge_in.interrupted_context_ttl_s,
        ));
        Self {
            utterances: UtteranceQueue::new(config.pipeline.utterance_queue_capacity),
            replies: ReplyQueue::new(),
            limiter: Arc::new(Semaphore::new(config.pipeline.max_concurrent_turns.max(1))),
            wake: Arc::new(WakeGate::from_config(&config.conversation)),
            cancel: CancellationToken::new(),
            session,
            config,
            listener,
            stt,
            reply,
            tts,
            sink,
            runtime_tx: None,
        }
    }

    /// Attach a runtime event broadcaster for UI/observability.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    /// Shared conversation state.
    pub fn session(&self) -> Session {
        self.session.clone()
    }

    pub fn utterance_queue(&self) -> UtteranceQueue {
        self.utterances.clone()
    }

    /// Ask the listener to re-measure ambient noise when it is next idle.
    pub fn request_noise_recalibration(&self) {
        emit_log(&self.runtime_tx, "noise recalibration requested");
        self.listener.request_recalibration();
    }

    /// Request graceful shutdown of the pipeline.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Get a clone of the cancellation token for external use.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the speaker loop, watchdog and listener, then dispatch turns
    /// until [`shutdown`](Self::shutdown) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be started.
    pub async fn run(&self) -> Result<()> {
        info!(
            "starting conversation runner: max_concurrent_turns={}, wake phrases={:?}",
            self.config.pipeline.max_concurrent_turns,
            self.wake.phrases()
        );

        let speaker = tokio::spawn(run_speaker_loop(
            SpeakerContext {
                session: self.session.clone(),
                replies: self.replies.clone(),
                reply: Arc::clone(&self.reply),
                tts: Arc::clone(&self.tts),
                sink: Arc::clone(&self.sink),
                runtime_tx: self.runtime_tx.clone(),
            },
            self.cancel.clone(),
        ));

        let idle_timeout = Duration::from_secs(self.config.conversation.idle_timeout_s);
        let watchdog = (!idle_timeout.is_zero()).then(|| {
            spawn_sleep_watchdog(
                self.session.clone(),
                idle_timeout,
                Duration::from_millis(self.config.conversation.watchdog_poll_ms.max(1)),
                self.runtime_tx.clone(),
                self.cancel.clone(),
            )
        });

        let listener = match self.start_listener().await {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to start listener: {e}");
                self.cancel.cancel();
                let _ = speaker.await;
                if let Some(watchdog) = watchdog {
                    let _ = watchdog.await;
                }
                return Err(e);
            }
        };
        emit_log(&self.runtime_tx, "listening");

        self.dispatch().await;

        info!("conversation runner shutting down");
        self.cancel.cancel();
        self.session.request_stop_playback();
        if let Err(e) = speaker.await {
            error!("speaker loop panicked: {e}");
        }
        if let Some(watchdog) = watchdog {
            let _ = watchdog.await;
        }
        if let Err(e) = tokio::task::spawn_blocking(move || listener.join()).await {
            warn!("listener join failed: {e}");
        }
        Ok(())
    }

    async fn start_listener(&self) -> Result<ListenerHandle> {
        let listener = Arc::clone(&self.listener);
        let queue = self.utterances.clone();
        let cancel = self.cancel.clone();
        let hooks = self.listener_hooks();
        tokio::task::spawn_blocking(move || listener.start(queue, cancel, hooks))
            .await
            .map_err(|e| SpeechError::Pipeline(format!("listener start task failed: {e}")))?
    }

    fn listener_hooks(&self) -> ListenerHooks {
        if !self.config.barge_in.enabled {
            return ListenerHooks::new(Arc::new(|| {}), self.runtime_tx.clone());
        }
        let session = self.session.clone();
        ListenerHooks::new(
            Arc::new(move || {
                if session.signal_speech_start() {
                    debug!("barge-in: user started speaking during playback");
                }
            }),
            self.runtime_tx.clone(),
        )
    }

    /// Dispatcher loop: one utterance in, at most K workers out.
    async fn dispatch(&self) {
        let ctx = TurnContext {
            session: self.session.clone(),
            replies: self.replies.clone(),
            wake: Arc::clone(&self.wake),
            stt: Arc::clone(&self.stt),
            reply: Arc::clone(&self.reply),
            runtime_tx: self.runtime_tx.clone(),
        };

        loop {
            let utterance = tokio::select! {
                () = self.cancel.cancelled() => break,
                utterance = self.utterances.pop() => utterance,
            };

            // Captured before waiting for a slot so a barge-in is attributed
            // to the utterance that caused it.
            let capture = self.session.take_interrupt(Instant::now());

            let permit = tokio::select! {
                () = self.cancel.cancelled() => break,
                permit = Arc::clone(&self.limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("turn limiter closed");
                        break;
                    }
                },
            };
            let guard = self.session.begin_turn(permit);
            spawn_turn(ctx.clone(), utterance, capture, guard);
        }
    }
}

fn spawn_turn(ctx: TurnContext, utterance: Utterance, capture: InterruptCapture, guard: TurnGuard) {
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = run_turn(&ctx, utterance, capture).await {
            error!("turn failed ({:?}): {e}", e.kind());
            emit_log(&ctx.runtime_tx, format!("turn failed: {e}"));
        }
    });
}

/// Ephemeral system instruction for a turn that interrupted playback.
pub fn build_interrupted_context(cut_off_reply: Option<&str>) -> String {
    let mut context = String::from(
        "The user started speaking while you were still answering. \
         Their message may be a correction or a follow-up to what you were saying.",
    );
    if let Some(text) = cut_off_reply.map(str::trim).filter(|t| !t.is_empty()) {
        context.push_str(
            "\n\nYour reply was cut off before the user heard all of it. It read:\n\"",
        );
        context.push_str(text);
        context.push_str("\"\nRefer to it only if it is relevant to the user's message.");
    }
    context
}

async fn run_turn(ctx: &TurnContext, utterance: Utterance, capture: InterruptCapture) -> Result<()> {
    let transcript = ctx.stt.transcribe(&utterance).await?;
    drop(utterance);
    let text = transcript.trim();
    if text.is_empty() {
        debug!("empty transcript, dropping turn");
        return Ok(());
    }

    // A reply is about to be superseded either way.
    ctx.session.request_stop_playback();
    emit(
        &ctx.runtime_tx,
        RuntimeEvent::UserTranscript {
            text: text.to_owned(),
        },
    );

    if !ctx.session.is_awake() {
        if !ctx.wake.is_wake_phrase(text) {
            debug!("asleep, ignoring: {text}");
            return Ok(());
        }
        if ctx.session.wake(Instant::now()) {
            emit(&ctx.runtime_tx, RuntimeEvent::Awake);
            emit_log(&ctx.runtime_tx, "wake phrase detected, listening");
        }
        if ctx.wake.is_wake_only(text) {
            return Ok(());
        }
    }

    let request = Request {
        id: ctx.session.next_request_id(),
        interrupted: capture.interrupted,
        interrupted_context: capture.context,
    };
    let ephemeral = request
        .interrupted
        .then(|| build_interrupted_context(request.interrupted_context.as_deref()));
    debug!(
        request_id = request.id,
        interrupted = request.interrupted,
        "generating reply"
    );

    let reply = ctx.reply.prepare_reply(text, ephemeral.as_deref()).await?;
    let reply = reply.trim();
    if reply.is_empty() {
        debug!(request_id = request.id, "empty reply, dropping turn");
        return Ok(());
    }

    let item = ReplyItem {
        request_id: request.id,
        text: reply.to_owned(),
    };
    match ctx.session.publish_if_latest(&ctx.replies, item) {
        PublishOutcome::Published { displaced } => {
            ctx.session.touch(Instant::now());
            if let Some(old) = displaced {
                debug!("reply {} replaced unplayed reply {old}", request.id);
            }
            emit(
                &ctx.runtime_tx,
                RuntimeEvent::AssistantReply {
                    request_id: request.id,
                    text: reply.to_owned(),
                },
            );
        }
        PublishOutcome::Stale => {
            debug!(request_id = request.id, "discarding stale reply");
        }
    }
    Ok(())
}

/// Sole consumer of the reply queue.
async fn run_speaker_loop(ctx: SpeakerContext, cancel: CancellationToken) {
    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = ctx.replies.pop() => item,
        };
        if !ctx.session.is_latest(item.request_id) {
            debug!(request_id = item.request_id, "skipping stale reply");
            continue;
        }

        let mut speaking = ctx.session.begin_speaking();
        if let Err(e) = speak_item(&ctx, &item).await {
            speaking.fail();
            error!("playback of reply {} failed: {e}", item.request_id);
            emit_log(&ctx.runtime_tx, format!("playback failed: {e}"));
        }
        drop(speaking);
    }
    debug!("speaker loop stopped");
}

async fn speak_item(ctx: &SpeakerContext, item: &ReplyItem) -> Result<SpeakOutcome> {
    let audio = ctx.tts.synthesize(&item.text).await?;
    if !ctx.session.is_latest(item.request_id) {
        debug!(request_id = item.request_id, "reply went stale during synthesis");
        return Ok(SpeakOutcome::Stale);
    }

    let completed = ctx
        .sink
        .play(audio, ctx.session.playback_cancel_flag())
        .await?;

    if completed {
        if !ctx.session.is_latest(item.request_id) {
            debug!(
                request_id = item.request_id,
                "committing reply heard in full although a newer request exists"
            );
        }
        ctx.reply.commit_assistant_reply(&item.text);
        ctx.session.touch(Instant::now());
        emit(
            &ctx.runtime_tx,
            RuntimeEvent::PlaybackCompleted {
                request_id: item.request_id,
            },
        );
        Ok(SpeakOutcome::Completed)
    } else {
        ctx.session
            .store_interrupted_context(&item.text, Instant::now());
        emit_log(&ctx.runtime_tx, "reply interrupted");
        emit(
            &ctx.runtime_tx,
            RuntimeEvent::PlaybackInterrupted {
                request_id: item.request_id,
            },
        );
        Ok(SpeakOutcome::Interrupted)
    }
}

/// Periodically put an idle session back to sleep.
pub fn spawn_sleep_watchdog(
    session: Session,
    idle_timeout: Duration,
    poll: Duration,
    runtime_tx: RuntimeSender,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(poll);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if session.try_sleep(Instant::now(), idle_timeout) {
                        emit(&runtime_tx, RuntimeEvent::Asleep);
                        emit_log(&runtime_tx, "idle timeout, going to sleep");
                    }
                }
            }
        }
    })
}
