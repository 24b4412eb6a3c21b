//! Collaborator failures abandon one turn or reply and nothing else.

use crate::helpers::{
    ConcurrencyProbe, FAIL, Harness, MockSink, ScriptedReply, ScriptedStt, UNSPEAKABLE, WAIT,
    test_config, wait_for, wait_for_log,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn failed_turns_release_their_slots() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(
        &[
            (FAIL, 40),
            (FAIL, 40),
            (FAIL, 40),
            ("broken generation", 0),
            ("hello", 0),
        ],
        &probe,
    );
    let reply = ScriptedReply::new(&[("broken generation", FAIL, 20)], &probe);
    let harness = Harness::start(test_config(2), stt, reply.clone(), MockSink::new(0)).await;
    harness.wake();

    // K + 1 transcription failures, then a generation failure.
    for index in 0..4 {
        harness.listener.say(index);
    }
    assert!(
        wait_for(WAIT, || reply.prepared_count() == 1).await,
        "dispatcher kept accepting turns after transcription failures"
    );
    assert!(
        wait_for(WAIT, || harness.runner.session().inflight_workers() == 0).await,
        "failed workers still hold slots"
    );
    assert!(probe.peak() <= 2);
    assert_eq!(harness.sink.started(), 0);

    harness.listener.say(4);
    assert!(
        wait_for(WAIT, || harness.sink.completed() == 1).await,
        "turn after failures was never spoken"
    );
    assert_eq!(reply.committed(), vec!["re: hello".to_owned()]);
    assert_eq!(harness.runner.session().inflight_workers(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn speaker_survives_synthesis_failure() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(&[("first", 0), ("second", 0)], &probe);
    let reply = ScriptedReply::new(&[("first", UNSPEAKABLE, 0)], &probe);
    let mut harness = Harness::start(test_config(1), stt, reply.clone(), MockSink::new(0)).await;
    harness.wake();

    harness.listener.say(0);
    wait_for_log(&mut harness.events, "playback failed").await;
    let session = harness.runner.session();
    assert!(wait_for(WAIT, || !session.is_speaking()).await);
    assert!(session.playback_cancel_flag().load(Ordering::SeqCst));
    assert_eq!(harness.sink.started(), 0);
    assert!(reply.committed().is_empty());

    harness.listener.say(1);
    assert!(
        wait_for(WAIT, || harness.sink.completed() == 1).await,
        "next reply was never spoken"
    );
    assert_eq!(reply.committed(), vec!["re: second".to_owned()]);
    harness.stop().await;
}

#[tokio::test]
async fn speaker_survives_playback_failure() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(&[("first", 0), ("second", 0)], &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let mut harness = Harness::start(test_config(1), stt, reply.clone(), MockSink::new(0)).await;
    harness.sink.fail_next(1);
    harness.wake();

    harness.listener.say(0);
    wait_for_log(&mut harness.events, "playback failed").await;
    let session = harness.runner.session();
    assert!(wait_for(WAIT, || !session.is_speaking()).await);
    assert!(session.playback_cancel_flag().load(Ordering::SeqCst));
    assert!(reply.committed().is_empty());
    assert!(
        session.take_interrupted_context(std::time::Instant::now()).is_none(),
        "a failed play is not an interruption"
    );

    harness.listener.say(1);
    assert!(
        wait_for(WAIT, || harness.sink.completed() == 1).await,
        "next reply was never spoken"
    );
    assert_eq!(reply.committed(), vec!["re: second".to_owned()]);
    harness.stop().await;
}
