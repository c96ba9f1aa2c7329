//! Rendezvous tests.
//!
//! These tests verify that subtasks blocked on an external decision are
//! woken by the matching post with the exact payload, that addressing is
//! per slot, and that blocked subtasks never stall other queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vrobot::orchestration::{ANSWER_FIELD, MACHINE_NAME_FIELD};
use vrobot::{subtask, Error, SubtaskCode};

use crate::fixtures::{codes, fields, Harness, TestHandler};

type Seen = Arc<Mutex<Vec<(usize, HashMap<String, String>)>>>;

/// A subtask that asks for a decision, stores what it got and returns 0
/// on "YES", 1 on anything else, 3 on timeout.
fn asking(options: &[&str], seen: &Seen) -> vrobot::orchestration::SubtaskCallback {
    let options: Vec<String> = options.iter().map(|s| s.to_string()).collect();
    let seen = Arc::clone(seen);
    subtask(move |ctx| -> SubtaskCode {
        match ctx.request_decision(options) {
            Ok(decision) => {
                let ok = decision.is_affirmative("YES");
                seen.lock().unwrap().push((ctx.index(), decision.into_fields()));
                if ok {
                    0
                } else {
                    1
                }
            }
            Err(Error::RendezvousTimeout { .. }) => 3,
            Err(_) => 99,
        }
    })
}

/// Test: Post delivers the exact payload
/// Given a subtask waiting for a decision on queue A
/// When the external actor posts ANSWER and MACHINE_NAME
/// Then the subtask sees exactly those fields and the handler runs
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_delivers_exact_payload() {
    let mut harness = Harness::new(&["A"], 2);
    let seen: Seen = Arc::default();

    let task = harness.enqueue("A", vec![asking(&["rv2f", "rv4f"], &seen)], TestHandler::H1);

    let request = harness.next_request().await;
    assert_eq!(request.key.queue.as_str(), "A");
    assert_eq!(request.key.task, task);
    assert_eq!(request.key.index, 0);
    assert_eq!(request.options, vec!["rv2f".to_string(), "rv4f".to_string()]);

    let posted = fields(&[(ANSWER_FIELD, "YES"), (MACHINE_NAME_FIELD, "rv4f"), ("EXTRA", "1")]);
    harness
        .orchestrator
        .post_decision(&request.key, posted.clone())
        .unwrap();

    let done = harness.next_completion().await;
    assert_eq!(done.task, task);
    assert!(done.status.successful());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, posted);
}

/// Test: Non-affirmative answer surfaces as a failure code
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_declined_answer_is_failure() {
    let mut harness = Harness::new(&["A"], 2);
    let seen: Seen = Arc::default();

    harness.enqueue("A", vec![asking(&["rv2f"], &seen)], TestHandler::H1);
    let request = harness.next_request().await;
    harness
        .orchestrator
        .post_decision(&request.key, fields(&[(ANSWER_FIELD, "NO")]))
        .unwrap();

    let done = harness.next_completion().await;
    assert_eq!(done.status.codes(), &[1]);
}

/// Test: Two waiters in one task are addressed separately
/// Given one composite task whose two subtasks both wait
/// When decisions are posted in reverse order by key
/// Then each subtask receives its own payload
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_waiters_addressed_per_slot() {
    let mut harness = Harness::new(&["A"], 4);
    let seen: Seen = Arc::default();

    harness.enqueue(
        "A",
        vec![asking(&["x"], &seen), asking(&["y"], &seen)],
        TestHandler::H1,
    );

    let r1 = harness.next_request().await;
    let r2 = harness.next_request().await;
    let mut keys = [r1.key, r2.key];
    keys.sort_by_key(|k| k.index);
    assert_eq!(keys[0].task, keys[1].task);

    harness
        .orchestrator
        .post_decision(&keys[1], fields(&[(ANSWER_FIELD, "YES"), ("FOR", "one")]))
        .unwrap();
    harness
        .orchestrator
        .post_decision(&keys[0], fields(&[(ANSWER_FIELD, "NO"), ("FOR", "zero")]))
        .unwrap();

    let done = harness.next_completion().await;
    assert_eq!(done.status.codes(), &[1, 0]);

    let seen = seen.lock().unwrap();
    for (index, payload) in seen.iter() {
        let expected = if *index == 0 { "zero" } else { "one" };
        assert_eq!(payload.get("FOR").map(String::as_str), Some(expected));
    }
}

/// Test: Queue-addressed post wakes the oldest waiter
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_addressed_post_wakes_oldest() {
    let mut harness = Harness::new(&["A"], 4);
    let seen: Seen = Arc::default();

    harness.enqueue(
        "A",
        vec![asking(&["x"], &seen), asking(&["y"], &seen)],
        TestHandler::H1,
    );

    let first = harness.next_request().await;
    let second = harness.next_request().await;
    let pending = harness.orchestrator.pending_decisions("A").unwrap();
    assert_eq!(pending, vec![first.key.clone(), second.key.clone()]);

    let woke = harness
        .orchestrator
        .post_decision_to_queue("A", fields(&[(ANSWER_FIELD, "YES")]))
        .unwrap();
    assert_eq!(woke, first.key);
    let woke = harness
        .orchestrator
        .post_decision_to_queue("A", fields(&[(ANSWER_FIELD, "YES")]))
        .unwrap();
    assert_eq!(woke, second.key);

    let done = harness.next_completion().await;
    assert!(done.status.successful());
    assert!(matches!(
        harness
            .orchestrator
            .post_decision_to_queue("A", HashMap::new()),
        Err(Error::DecisionNotPending(_))
    ));
}

/// Test: Unanswered rendezvous times out
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unanswered_decision_times_out() {
    let mut harness = Harness::with_decision_timeout(&["A"], 2, Some(Duration::from_millis(50)));
    let seen: Seen = Arc::default();

    harness.enqueue("A", vec![asking(&["x"], &seen)], TestHandler::H1);
    let request = harness.next_request().await;

    let done = harness.next_completion().await;
    assert_eq!(done.status.codes(), &[3]);
    assert!(seen.lock().unwrap().is_empty());
    assert!(harness.orchestrator.pending_decisions("A").unwrap().is_empty());

    // A late answer finds nobody waiting.
    assert!(matches!(
        harness.orchestrator.post_decision(&request.key, HashMap::new()),
        Err(Error::DecisionNotPending(_))
    ));
}

/// Test: A blocked subtask does not stall other queues
/// Given a subtask on A waiting for a decision
/// When work is enqueued on B and on A
/// Then B completes, A's new task waits its turn, and both finish after
/// the decision is posted
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocked_subtask_does_not_stall_other_queues() {
    let mut harness = Harness::new(&["A", "B"], 4);
    let seen: Seen = Arc::default();

    let waiting = harness.enqueue("A", vec![asking(&["x"], &seen)], TestHandler::H1);
    let request = harness.next_request().await;

    let behind = harness.enqueue("A", codes(&[0]), TestHandler::H1);
    let other = harness.enqueue("B", codes(&[0, 0]), TestHandler::H2);

    let done = harness.next_completion().await;
    assert_eq!(done.task, other);
    let snap = harness.orchestrator.queue_snapshot("A").unwrap();
    assert_eq!(snap.pending, 2);
    assert_eq!(snap.head, Some(waiting));

    harness
        .orchestrator
        .post_decision(&request.key, fields(&[(ANSWER_FIELD, "YES")]))
        .unwrap();
    let done = harness.take_completions(2).await;
    assert_eq!(done[0].task, waiting);
    assert_eq!(done[1].task, behind);
}
