//! Wake gating and the full generate-play-commit path.

use crate::helpers::{
    ConcurrencyProbe, FixedChat, Harness, MockSink, ScriptedReply, ScriptedStt, WAIT,
    drain_events, test_config, wait_for,
};
use buddy::memory::ChatRole;
use buddy::{ConversationService, MemoryService, RuntimeEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn wake_then_question_speaks_and_commits_one_exchange() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(&[("Buddy", 0), ("Buddy what is two plus two", 0)], &probe);
    let config = test_config(2);
    let memory = Arc::new(Mutex::new(MemoryService::from_config(&config.memory)));
    let service = ConversationService::new(FixedChat("Four."), Arc::clone(&memory), &config.llm);
    let mut harness = Harness::start(config, stt, Arc::new(service), MockSink::new(10)).await;
    let session = harness.runner.session();
    assert!(!session.is_awake());

    harness.listener.say(0);
    assert!(wait_for(WAIT, || session.is_awake()).await);
    assert_eq!(session.snapshot().latest_request_id, 0, "wake-only consumes no id");
    assert!(memory.lock().unwrap().is_empty());

    harness.listener.say(1);
    assert!(wait_for(WAIT, || harness.sink.completed() == 1).await);
    assert!(wait_for(WAIT, || memory.lock().unwrap().len() == 2).await);
    assert_eq!(session.snapshot().latest_request_id, 1);

    {
        let memory = memory.lock().unwrap();
        let messages = memory.recent(10);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].content, "Buddy what is two plus two");
        assert_eq!(messages[1].role, ChatRole::Assistant);
        assert_eq!(messages[1].content, "Four.");
    }

    let events = drain_events(&mut harness.events);
    assert!(events.contains(&RuntimeEvent::Awake));
    assert!(events.contains(&RuntimeEvent::AssistantReply {
        request_id: 1,
        text: "Four.".to_owned()
    }));
    assert!(events.contains(&RuntimeEvent::PlaybackCompleted { request_id: 1 }));
    harness.stop().await;
}

#[tokio::test]
async fn asleep_session_ignores_non_wake_speech() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(&[("nobody here", 0), ("what time is it", 0)], &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let harness = Harness::start(test_config(2), stt, reply.clone(), MockSink::new(0)).await;

    harness.listener.say(0);
    harness.listener.say(1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let session = harness.runner.session();
    assert!(!session.is_awake());
    assert_eq!(session.snapshot().latest_request_id, 0);
    assert_eq!(reply.prepared_count(), 0);
    assert_eq!(harness.sink.started(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn empty_transcript_is_dropped_silently() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(&[("   ", 0)], &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let harness = Harness::start(test_config(2), stt, reply.clone(), MockSink::new(0)).await;
    harness.wake();

    harness.listener.say(0);
    assert!(wait_for(WAIT, || harness.runner.session().inflight_workers() == 0
        && harness.runner.utterance_queue().is_empty())
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reply.prepared_count(), 0);
    assert_eq!(harness.runner.session().snapshot().latest_request_id, 0);
    harness.stop().await;
}

#[tokio::test]
async fn recalibration_request_reaches_listener() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(&[], &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let harness = Harness::start(test_config(1), stt, reply, MockSink::new(0)).await;
    harness.runner.request_noise_recalibration();
    assert_eq!(harness.listener.recalibrations(), 1);
    harness.stop().await;
}
