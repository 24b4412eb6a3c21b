//! A reply is spoken only while its request is the latest one.

use crate::helpers::{
    ConcurrencyProbe, Harness, MockSink, ScriptedReply, ScriptedStt, WAIT, drain_events,
    test_config, wait_for,
};
use buddy::RuntimeEvent;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn older_request_finishing_last_is_never_spoken() {
    let probe = Arc::new(ConcurrencyProbe::default());
    // a is transcribed first (id 1) but generates slowly; b gets id 2.
    let stt = ScriptedStt::new(&[("question a", 0), ("question b", 60)], &probe);
    let reply = ScriptedReply::new(
        &[
            ("question a", "answer a", 400),
            ("question b", "answer b", 0),
        ],
        &probe,
    );
    let mut harness = Harness::start(test_config(2), stt, reply.clone(), MockSink::new(20)).await;
    harness.wake();

    harness.listener.say(0);
    harness.listener.say(1);

    assert!(wait_for(WAIT, || reply.committed() == vec!["answer b".to_owned()]).await);
    // Give a's generation time to finish and be discarded.
    assert!(wait_for(WAIT, || reply.prepared_count() == 2).await);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(reply.committed(), vec!["answer b".to_owned()]);
    assert_eq!(harness.sink.started(), 1);
    assert_eq!(harness.runner.session().snapshot().latest_request_id, 2);

    let published: Vec<u64> = drain_events(&mut harness.events)
        .into_iter()
        .filter_map(|event| match event {
            RuntimeEvent::AssistantReply { request_id, .. } => Some(request_id),
            _ => None,
        })
        .collect();
    assert_eq!(published, vec![2]);
    harness.stop().await;
}

#[tokio::test]
async fn new_transcript_stops_current_playback() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(&[("first", 0), ("second", 0)], &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let harness = Harness::start(test_config(2), stt, reply.clone(), MockSink::new(300)).await;
    harness.wake();

    harness.listener.say(0);
    assert!(wait_for(WAIT, || harness.sink.started() == 1).await);
    harness.listener.say(1);

    assert!(wait_for(WAIT, || reply.committed() == vec!["re: second".to_owned()]).await);
    assert_eq!(harness.sink.cut_short(), 1);
    assert_eq!(harness.sink.completed(), 1);

    // Cut off by a transcript, not by speech onset: no interrupt is pending,
    // but the cut-off text is cached.
    let snapshot = harness.runner.session().snapshot();
    assert!(!snapshot.interrupt_pending);
    assert!(snapshot.has_interrupted_context);
    harness.stop().await;
}
