//! The dispatcher never runs more than K turns at once.

use crate::helpers::{ConcurrencyProbe, Harness, MockSink, ScriptedReply, ScriptedStt, WAIT, test_config, wait_for};
use std::sync::Arc;

const LINES: &[(&str, u64)] = &[
    ("question zero", 80),
    ("question one", 80),
    ("question two", 80),
    ("question three", 80),
    ("question four", 80),
    ("question five", 80),
];

async fn peak_with_limit(k: usize) -> usize {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(LINES, &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let harness = Harness::start(test_config(k), stt, reply.clone(), MockSink::new(0)).await;
    harness.wake();

    for index in 0..LINES.len() {
        harness.listener.say(index);
    }
    assert!(
        wait_for(WAIT, || reply.prepared_count() == LINES.len()).await,
        "every turn reaches reply generation"
    );
    assert!(
        wait_for(WAIT, || harness.runner.session().inflight_workers() == 0).await,
        "workers release their slots"
    );
    harness.stop().await;
    probe.peak()
}

#[tokio::test]
async fn burst_of_utterances_is_bounded_by_two_slots() {
    let peak = peak_with_limit(2).await;
    assert_eq!(peak, 2);
}

#[tokio::test]
async fn single_slot_serializes_turns() {
    assert_eq!(peak_with_limit(1).await, 1);
}

#[tokio::test]
async fn burst_overflow_drops_oldest_utterances() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let stt = ScriptedStt::new(LINES, &probe);
    let reply = ScriptedReply::new(&[], &probe);
    let mut config = test_config(1);
    config.pipeline.utterance_queue_capacity = 1;
    let harness = Harness::start(config, stt, reply.clone(), MockSink::new(0)).await;
    harness.wake();

    // Fill the queue while the dispatcher is parked; only the newest survives.
    let queue = harness.runner.utterance_queue();
    harness.listener.say(0);
    assert!(wait_for(WAIT, || queue.is_empty()).await);
    for index in 1..LINES.len() {
        harness.listener.say(index);
    }
    assert!(queue.len() <= 1);

    assert!(wait_for(WAIT, || reply.prepared_count() >= 2).await);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let prepared: Vec<String> = reply
        .prepared
        .lock()
        .unwrap()
        .iter()
        .map(|(text, _)| text.clone())
        .collect();
    assert!(prepared.contains(&"question five".to_owned()));
    assert!(prepared.len() < LINES.len());
    harness.stop().await;
}
