//! Scripted collaborators and a harness that runs a [`ConversationRunner`]
//! against them.

use async_trait::async_trait;
use buddy::audio::{AudioSink, ListenerHandle, ListenerHooks, UtteranceListener};
use buddy::llm::{ChatClient, ReplyGenerator};
use buddy::memory::ChatMessage;
use buddy::pipeline::messages::{SynthesizedAudio, Utterance};
use buddy::pipeline::queues::UtteranceQueue;
use buddy::stt::SpeechToText;
use buddy::tts::TextToSpeech;
use buddy::{ConversationRunner, RuntimeEvent, SpeechConfig, SpeechError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Script text that makes STT or reply generation return an error.
pub(crate) const FAIL: &str = "__fail";

/// Reply text that [`MockTts`] refuses to synthesize.
pub(crate) const UNSPEAKABLE: &str = "__unspeakable";

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub(crate) async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Drain all pending events from the broadcast receiver into a Vec.
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Ok(evt) = rx.try_recv() {
        events.push(evt);
    }
    events
}

/// Collect events until one is a log line containing `needle`.
pub(crate) async fn wait_for_log(
    rx: &mut broadcast::Receiver<RuntimeEvent>,
    needle: &str,
) -> Vec<RuntimeEvent> {
    let mut seen = Vec::new();
    let found = wait_for(WAIT, || {
        seen.extend(drain_events(rx));
        seen.iter()
            .any(|evt| matches!(evt, RuntimeEvent::Log { message } if message.contains(needle)))
    })
    .await;
    assert!(found, "no log containing {needle:?} in {seen:?}");
    seen
}

/// Defaults with the watchdog disabled and `k` concurrent turns.
pub(crate) fn test_config(k: usize) -> SpeechConfig {
    let mut config = SpeechConfig::default();
    config.pipeline.max_concurrent_turns = k;
    config.conversation.idle_timeout_s = 0;
    config
}

/// Tracks how many scripted calls are in flight at once.
#[derive(Default)]
pub(crate) struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Listener driven by the test: utterances are pushed explicitly.
#[derive(Default)]
pub(crate) struct MockListener {
    queue: Mutex<Option<UtteranceQueue>>,
    hooks: Mutex<Option<ListenerHooks>>,
    recalibrations: AtomicUsize,
}

impl MockListener {
    /// Push the utterance whose transcript is script line `index`.
    pub(crate) fn say(&self, index: usize) {
        let queue = self.queue.lock().unwrap().clone().expect("listener started");
        queue.push(Utterance::new(vec![index as f32; 160], 16_000));
    }

    /// Fire the speech-start hook as the VAD would.
    pub(crate) fn speech_start(&self) {
        let hooks = self.hooks.lock().unwrap().clone().expect("listener started");
        (hooks.on_speech_start)();
    }

    pub(crate) fn is_started(&self) -> bool {
        self.queue.lock().unwrap().is_some()
    }

    pub(crate) fn recalibrations(&self) -> usize {
        self.recalibrations.load(Ordering::SeqCst)
    }
}

impl UtteranceListener for MockListener {
    fn start(
        &self,
        queue: UtteranceQueue,
        _cancel: tokio_util::sync::CancellationToken,
        hooks: ListenerHooks,
    ) -> buddy::Result<ListenerHandle> {
        *self.queue.lock().unwrap() = Some(queue);
        *self.hooks.lock().unwrap() = Some(hooks);
        Ok(ListenerHandle::detached())
    }

    fn request_recalibration(&self) {
        self.recalibrations.fetch_add(1, Ordering::SeqCst);
    }
}

/// STT that maps an utterance's first sample to a script line. A [`FAIL`]
/// line returns an error after its delay.
pub(crate) struct ScriptedStt {
    lines: Vec<(String, Duration)>,
    probe: Arc<ConcurrencyProbe>,
}

impl ScriptedStt {
    pub(crate) fn new(lines: &[(&str, u64)], probe: &Arc<ConcurrencyProbe>) -> Arc<Self> {
        Arc::new(Self {
            lines: lines
                .iter()
                .map(|(text, ms)| ((*text).to_owned(), Duration::from_millis(*ms)))
                .collect(),
            probe: Arc::clone(probe),
        })
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, utterance: &Utterance) -> buddy::Result<String> {
        let index = utterance.samples.first().copied().unwrap_or_default() as usize;
        let (text, delay) = self.lines.get(index).cloned().unwrap_or_default();
        self.probe.enter();
        tokio::time::sleep(delay).await;
        self.probe.exit();
        if text == FAIL {
            return Err(SpeechError::Stt("scripted transcription failure".into()));
        }
        Ok(text)
    }
}

/// Reply generator with per-input replies and delays. A [`FAIL`] reply
/// returns an error after its delay.
pub(crate) struct ScriptedReply {
    replies: HashMap<String, (String, Duration)>,
    probe: Arc<ConcurrencyProbe>,
    pub(crate) prepared: Mutex<Vec<(String, Option<String>)>>,
    pub(crate) committed: Mutex<Vec<String>>,
}

impl ScriptedReply {
    /// Inputs not listed get `re: <input>` immediately.
    pub(crate) fn new(replies: &[(&str, &str, u64)], probe: &Arc<ConcurrencyProbe>) -> Arc<Self> {
        Arc::new(Self {
            replies: replies
                .iter()
                .map(|(input, reply, ms)| {
                    (
                        (*input).to_owned(),
                        ((*reply).to_owned(), Duration::from_millis(*ms)),
                    )
                })
                .collect(),
            probe: Arc::clone(probe),
            prepared: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn prepared_count(&self) -> usize {
        self.prepared.lock().unwrap().len()
    }

    pub(crate) fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }

    /// Ephemeral context passed with the turn for `input`.
    pub(crate) fn ephemeral_for(&self, input: &str) -> Option<Option<String>> {
        self.prepared
            .lock()
            .unwrap()
            .iter()
            .find(|(text, _)| text == input)
            .map(|(_, ephemeral)| ephemeral.clone())
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedReply {
    async fn prepare_reply(
        &self,
        user_text: &str,
        ephemeral_context: Option<&str>,
    ) -> buddy::Result<String> {
        self.prepared
            .lock()
            .unwrap()
            .push((user_text.to_owned(), ephemeral_context.map(str::to_owned)));
        let (reply, delay) = self
            .replies
            .get(user_text)
            .cloned()
            .unwrap_or_else(|| (format!("re: {user_text}"), Duration::ZERO));
        self.probe.enter();
        tokio::time::sleep(delay).await;
        self.probe.exit();
        if reply == FAIL {
            return Err(SpeechError::Llm("scripted generation failure".into()));
        }
        Ok(reply)
    }

    fn commit_assistant_reply(&self, text: &str) {
        self.committed.lock().unwrap().push(text.to_owned());
    }
}

/// Chat client that always answers with the same text.
pub(crate) struct FixedChat(pub(crate) &'static str);

#[async_trait]
impl ChatClient for FixedChat {
    async fn complete_messages(&self, _messages: &[ChatMessage]) -> buddy::Result<String> {
        Ok(self.0.to_owned())
    }
}

/// TTS producing one sample per character. [`UNSPEAKABLE`] fails.
pub(crate) struct MockTts;

#[async_trait]
impl TextToSpeech for MockTts {
    async fn synthesize(&self, text: &str) -> buddy::Result<SynthesizedAudio> {
        if text == UNSPEAKABLE {
            return Err(SpeechError::Tts("scripted synthesis failure".into()));
        }
        Ok(SynthesizedAudio {
            samples: vec![0.0; text.len()],
            sample_rate: 24_000,
        })
    }
}

/// Sink that "plays" for a fixed time and stops when the cancel flag is set.
pub(crate) struct MockSink {
    duration: Duration,
    fail_plays: AtomicUsize,
    pub(crate) started: AtomicUsize,
    pub(crate) completed: AtomicUsize,
    pub(crate) cut_short: AtomicUsize,
}

impl MockSink {
    pub(crate) fn new(duration_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            duration: Duration::from_millis(duration_ms),
            fail_plays: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            cut_short: AtomicUsize::new(0),
        })
    }

    /// Make the next `n` plays fail as a broken output device would.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_plays.store(n, Ordering::SeqCst);
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn cut_short(&self) -> usize {
        self.cut_short.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for MockSink {
    async fn play(&self, _audio: SynthesizedAudio, cancel: Arc<AtomicBool>) -> buddy::Result<bool> {
        if self
            .fail_plays
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SpeechError::Audio("scripted output device failure".into()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.duration;
        while tokio::time::Instant::now() < deadline {
            if cancel.load(Ordering::SeqCst) {
                self.cut_short.fetch_add(1, Ordering::SeqCst);
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// A running [`ConversationRunner`] wired to scripted collaborators.
pub(crate) struct Harness {
    pub(crate) runner: Arc<ConversationRunner>,
    pub(crate) listener: Arc<MockListener>,
    pub(crate) sink: Arc<MockSink>,
    pub(crate) events: broadcast::Receiver<RuntimeEvent>,
    task: JoinHandle<buddy::Result<()>>,
}

impl Harness {
    pub(crate) async fn start(
        config: SpeechConfig,
        stt: Arc<dyn SpeechToText>,
        reply: Arc<dyn ReplyGenerator>,
        sink: Arc<MockSink>,
    ) -> Self {
        let listener = Arc::new(MockListener::default());
        let (tx, events) = broadcast::channel(256);
        let runner = Arc::new(
            ConversationRunner::new(
                config,
                Arc::clone(&listener) as Arc<dyn UtteranceListener>,
                stt,
                reply,
                Arc::new(MockTts),
                Arc::clone(&sink) as Arc<dyn AudioSink>,
            )
            .with_runtime_events(tx),
        );
        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run().await })
        };
        assert!(
            wait_for(WAIT, || listener.is_started()).await,
            "listener never started"
        );
        Self {
            runner,
            listener,
            sink,
            events,
            task,
        }
    }

    /// Wake the session without going through a transcript.
    pub(crate) fn wake(&self) {
        self.runner.session().wake(std::time::Instant::now());
    }

    pub(crate) async fn stop(self) {
        self.runner.shutdown();
        let result = tokio::time::timeout(WAIT, self.task)
            .await
            .expect("runner stops after shutdown")
            .expect("runner task did not panic");
        assert!(result.is_ok(), "runner returned {result:?}");
    }
}
