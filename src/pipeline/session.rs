//! Shared conversation state behind a single lock.
//!
//! Every read-then-act sequence on the awake flag, the latest request id,
//! the in-flight counter, the speaking/interrupt flags and the interrupted
//! reply cache happens inside one critical section of [`Session`]. Critical
//! sections never await and never do I/O.
//!
//! The playback cancel flag is the one piece of state outside the lock: the
//! audio sink polls it from its own thread. It is only ever *set* while the
//! lock is held, so "interrupt pending" and "cancel playback" flip together.

use crate::pipeline::lock;
use crate::pipeline::messages::ReplyItem;
use crate::pipeline::queues::ReplyQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;

/// A reply whose playback was cut short by barge-in.
#[derive(Debug, Clone, Default)]
struct InterruptedReply {
    assistant_text: Option<String>,
    set_at: Option<Instant>,
}

impl InterruptedReply {
    /// Take the cached text if it is still within `ttl`; the cache is
    /// cleared either way.
    fn take_fresh(&mut self, now: Instant, ttl: Duration) -> Option<String> {
        let text = self.assistant_text.take();
        let set_at = self.set_at.take();
        match (text, set_at) {
            (Some(text), Some(at)) if now.saturating_duration_since(at) <= ttl => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct ConversationState {
    is_awake: bool,
    last_activity_at: Instant,
    inflight_workers: usize,
    latest_request_id: u64,
    is_speaking: bool,
    interrupt_pending: bool,
    interrupted: InterruptedReply,
}

/// Point-in-time copy of the session state, for observers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub is_awake: bool,
    pub inflight_workers: usize,
    pub latest_request_id: u64,
    pub is_speaking: bool,
    pub interrupt_pending: bool,
    pub has_interrupted_context: bool,
}

/// What the dispatcher captured for the next turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptCapture {
    pub interrupted: bool,
    pub context: Option<String>,
}

/// Result of offering a reply to the reply queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Reply queued; carries the request id of the reply it displaced.
    Published { displaced: Option<u64> },
    /// A newer request exists; the reply was dropped.
    Stale,
}

struct SessionInner {
    state: Mutex<ConversationState>,
    cancel_playback: Arc<AtomicBool>,
    interrupted_ttl: Duration,
}

/// Cloneable handle to the shared conversation state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create an asleep session. `interrupted_ttl` bounds how long a cut-off
    /// reply stays available to the next interrupted turn.
    pub fn new(interrupted_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(ConversationState {
                    is_awake: false,
                    last_activity_at: Instant::now(),
                    inflight_workers: 0,
                    latest_request_id: 0,
                    is_speaking: false,
                    interrupt_pending: false,
                    interrupted: InterruptedReply::default(),
                }),
                cancel_playback: Arc::new(AtomicBool::new(false)),
                interrupted_ttl,
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = lock(&self.inner.state);
        SessionSnapshot {
            is_awake: state.is_awake,
            inflight_workers: state.inflight_workers,
            latest_request_id: state.latest_request_id,
            is_speaking: state.is_speaking,
            interrupt_pending: state.interrupt_pending,
            has_interrupted_context: state.interrupted.assistant_text.is_some(),
        }
    }

    pub fn is_awake(&self) -> bool {
        lock(&self.inner.state).is_awake
    }

    /// Flip to awake and record activity. Returns `true` if the session was
    /// asleep.
    pub fn wake(&self, now: Instant) -> bool {
        let mut state = lock(&self.inner.state);
        let was_asleep = !state.is_awake;
        state.is_awake = true;
        state.last_activity_at = now;
        was_asleep
    }

    /// Refresh the last-activity timestamp.
    pub fn touch(&self, now: Instant) {
        lock(&self.inner.state).last_activity_at = now;
    }

    // -- Request epoch --

    /// Issue a new request id and make it the latest.
    pub fn next_request_id(&self) -> u64 {
        let mut state = lock(&self.inner.state);
        state.latest_request_id += 1;
        state.latest_request_id
    }

    pub fn is_latest(&self, request_id: u64) -> bool {
        lock(&self.inner.state).latest_request_id == request_id
    }

    /// Queue `item` only if its request is still the latest. The staleness
    /// check and the queue replacement happen under the state lock, so a
    /// newer request cannot be issued in between.
    pub fn publish_if_latest(&self, queue: &ReplyQueue, item: ReplyItem) -> PublishOutcome {
        let state = lock(&self.inner.state);
        if state.latest_request_id != item.request_id {
            return PublishOutcome::Stale;
        }
        let displaced = queue.replace(item).map(|old| old.request_id);
        drop(state);
        PublishOutcome::Published { displaced }
    }

    // -- Worker accounting --

    /// Register a worker holding `permit`. The returned guard releases both
    /// the in-flight count and the permit when dropped.
    pub fn begin_turn(&self, permit: OwnedSemaphorePermit) -> TurnGuard {
        lock(&self.inner.state).inflight_workers += 1;
        TurnGuard {
            session: self.clone(),
            _permit: permit,
        }
    }

    pub fn inflight_workers(&self) -> usize {
        lock(&self.inner.state).inflight_workers
    }

    // -- Playback / barge-in --

    /// Shared flag the audio sink polls to stop playback early.
    pub fn playback_cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.cancel_playback)
    }

    pub fn is_speaking(&self) -> bool {
        lock(&self.inner.state).is_speaking
    }

    /// Speech-start callback body. If a reply is playing, cancel it and mark
    /// the next turn as interrupted. Returns `true` if a barge-in happened.
    pub fn signal_speech_start(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if !state.is_speaking {
            return false;
        }
        state.interrupt_pending = true;
        self.inner.cancel_playback.store(true, Ordering::SeqCst);
        true
    }

    /// Ask any current playback to stop, without marking an interrupt.
    pub fn request_stop_playback(&self) {
        let _state = lock(&self.inner.state);
        self.inner.cancel_playback.store(true, Ordering::SeqCst);
    }

    /// Clear the cancel flag and mark the speaker as active. Dropping the
    /// guard clears `is_speaking`.
    pub fn begin_speaking(&self) -> SpeakingGuard {
        let mut state = lock(&self.inner.state);
        self.inner.cancel_playback.store(false, Ordering::SeqCst);
        state.is_speaking = true;
        SpeakingGuard {
            session: self.clone(),
            failed: false,
        }
    }

    /// Atomically read-and-clear the interrupt flag and, when it was set,
    /// the cached cut-off reply (only returned if within its TTL).
    pub fn take_interrupt(&self, now: Instant) -> InterruptCapture {
        let mut state = lock(&self.inner.state);
        if !std::mem::take(&mut state.interrupt_pending) {
            return InterruptCapture::default();
        }
        let context = state.interrupted.take_fresh(now, self.inner.interrupted_ttl);
        InterruptCapture {
            interrupted: true,
            context,
        }
    }

    /// Cache the text of a reply that was cut short.
    pub fn store_interrupted_context(&self, assistant_text: &str, now: Instant) {
        let mut state = lock(&self.inner.state);
        state.interrupted = InterruptedReply {
            assistant_text: Some(assistant_text.to_owned()),
            set_at: Some(now),
        };
    }

    /// Read-and-clear the cached cut-off reply. Returns `None` once consumed
    /// or after the TTL elapsed.
    pub fn take_interrupted_context(&self, now: Instant) -> Option<String> {
        let mut state = lock(&self.inner.state);
        state.interrupted.take_fresh(now, self.inner.interrupted_ttl)
    }

    // -- Idle sleep --

    /// Flip awake→asleep if the session is awake, silent, has no in-flight
    /// workers, and has been idle for at least `idle_timeout`. All conditions
    /// are checked in the same critical section as the flip.
    pub fn try_sleep(&self, now: Instant, idle_timeout: Duration) -> bool {
        let mut state = lock(&self.inner.state);
        let idle = now.saturating_duration_since(state.last_activity_at);
        if !state.is_awake
            || state.is_speaking
            || state.inflight_workers > 0
            || idle < idle_timeout
        {
            return false;
        }
        state.is_awake = false;
        true
    }
}

/// Releases a worker's in-flight slot and limiter permit on drop.
pub struct TurnGuard {
    session: Session,
    _permit: OwnedSemaphorePermit,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.session.inner.state);
        state.inflight_workers = state.inflight_workers.saturating_sub(1);
    }
}

/// Clears `is_speaking` on drop; after [`SpeakingGuard::fail`] it also forces
/// the cancel flag so nothing keeps playing.
pub struct SpeakingGuard {
    session: Session,
    failed: bool,
}

impl SpeakingGuard {
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.session.inner.state);
        if self.failed {
            self.session
                .inner
                .cancel_playback
                .store(true, Ordering::SeqCst);
        }
        state.is_speaking = false;
    }
}
