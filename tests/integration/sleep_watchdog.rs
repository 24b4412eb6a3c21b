//! Idle sessions fall back asleep; busy ones stay awake.

use crate::helpers::{
    ConcurrencyProbe, Harness, MockSink, ScriptedReply, ScriptedStt, WAIT, test_config, wait_for,
};
use buddy::RuntimeEvent;
use std::sync::Arc;
use std::time::Duration;

fn watchdog_config() -> buddy::SpeechConfig {
    let mut config = test_config(2);
    config.conversation.idle_timeout_s = 1;
    config.conversation.watchdog_poll_ms = 20;
    config
}

#[tokio::test]
async fn idle_session_goes_back_to_sleep() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(&[("buddy", 0)], &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let mut harness = Harness::start(watchdog_config(), stt, reply, MockSink::new(0)).await;
    let session = harness.runner.session();

    harness.listener.say(0);
    assert!(wait_for(WAIT, || session.is_awake()).await);
    assert!(wait_for(WAIT, || !session.is_awake()).await);

    let mut saw_asleep = false;
    while let Ok(event) = harness.events.try_recv() {
        saw_asleep |= event == RuntimeEvent::Asleep;
    }
    assert!(saw_asleep);
    harness.stop().await;
}

#[tokio::test]
async fn in_flight_turn_keeps_session_awake() {
    let probe = Arc::new(ConcurrencyProbe::default());
    // Transcription outlasts the idle timeout.
    let stt = ScriptedStt::new(&[("are you there", 1_800)], &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let harness = Harness::start(watchdog_config(), stt, reply.clone(), MockSink::new(0)).await;
    harness.wake();
    let session = harness.runner.session();

    harness.listener.say(0);
    assert!(wait_for(WAIT, || session.inflight_workers() == 1).await);
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert!(session.is_awake(), "worker in flight prevents sleep");

    // The finished turn refreshes activity, then idleness wins again.
    assert!(wait_for(WAIT, || reply.committed().len() == 1).await);
    assert!(session.is_awake());
    assert!(wait_for(WAIT, || !session.is_awake()).await);
    harness.stop().await;
}
