//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Starting an orchestrator with recording completion handlers
//! - Canned subtask bodies (fixed codes, sleeps, panics)
//! - A concurrency tracker for mutual-exclusion checks
//! - A controller over a simulated fleet

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tokio::sync::mpsc;

use vrobot::config::{Config, MachineConfig};
use vrobot::machine::{Controller, Fleet, SimulatedMachine};
use vrobot::orchestration::{
    subtask, Completion, DecisionRequest, HandlerTable, Orchestrator, OrchestratorEvent,
    OrchestratorOptions, QueueId, QueueRegistry, SubtaskCallback, SubtaskCode, TaskId,
};

/// How long any single wait in a test may take before it fails.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestHandler {
    H1,
    H2,
    /// Enqueues one `H2` task with a single successful subtask into its own
    /// queue, then records.
    FollowUp,
    /// Panics without recording.
    Panics,
}

/// A running orchestrator whose handlers forward every completion.
pub struct Harness {
    pub orchestrator: Orchestrator<TestHandler>,
    pub completions: mpsc::UnboundedReceiver<Completion<TestHandler>>,
    pub requests: Receiver<DecisionRequest>,
    pub events: mpsc::UnboundedReceiver<OrchestratorEvent>,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub fn new(queues: &[&str], max_workers: usize) -> Self {
        Self::with_decision_timeout(queues, max_workers, Some(TEST_TIMEOUT))
    }

    pub fn with_decision_timeout(
        queues: &[&str],
        max_workers: usize,
        decision_timeout: Option<Duration>,
    ) -> Self {
        let (tx, completions) = mpsc::unbounded_channel();

        let mut handlers = HandlerTable::new();
        for id in [TestHandler::H1, TestHandler::H2] {
            let tx = tx.clone();
            handlers
                .register(id, move |_, c: &Completion<TestHandler>| {
                    let _ = tx.send(c.clone());
                })
                .unwrap();
        }
        let follow_tx = tx.clone();
        handlers
            .register(
                TestHandler::FollowUp,
                move |orch: &Orchestrator<TestHandler>, c: &Completion<TestHandler>| {
                    orch.enqueue(c.queue.as_str(), codes(&[0]), TestHandler::H2)
                        .expect("re-entrant enqueue failed");
                    let _ = follow_tx.send(c.clone());
                },
            )
            .unwrap();
        handlers
            .register(TestHandler::Panics, |_, _| panic!("handler failure"))
            .unwrap();

        let mut registry = QueueRegistry::builder();
        registry.register_all(queues.iter().copied()).unwrap();

        let (orchestrator, requests) = Orchestrator::start(
            registry,
            handlers,
            OrchestratorOptions {
                max_workers,
                decision_timeout,
            },
        )
        .unwrap();
        let events = orchestrator.subscribe();

        Self {
            orchestrator,
            completions,
            requests,
            events,
        }
    }

    pub fn enqueue(
        &self,
        queue: &str,
        subtasks: Vec<SubtaskCallback>,
        handler: TestHandler,
    ) -> TaskId {
        self.orchestrator.enqueue(queue, subtasks, handler).unwrap()
    }

    pub async fn next_completion(&mut self) -> Completion<TestHandler> {
        tokio::time::timeout(TEST_TIMEOUT, self.completions.recv())
            .await
            .expect("timed out waiting for a completion")
            .expect("completion channel closed")
    }

    pub async fn take_completions(&mut self, n: usize) -> Vec<Completion<TestHandler>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next_completion().await);
        }
        out
    }

    /// Collect events until `queue` goes idle.
    pub async fn events_until_idle(&mut self, queue: &str) -> Vec<OrchestratorEvent> {
        let mut out = Vec::new();
        loop {
            let event = tokio::time::timeout(TEST_TIMEOUT, self.events.recv())
                .await
                .expect("timed out waiting for idle")
                .expect("event channel closed");
            let done = matches!(&event, OrchestratorEvent::Idle { queue: q } if q.as_str() == queue);
            out.push(event);
            if done {
                return out;
            }
        }
    }

    /// Block (off the runtime) until the next decision request arrives.
    pub async fn next_request(&self) -> DecisionRequest {
        let requests = self.requests.clone();
        tokio::task::spawn_blocking(move || requests.recv_timeout(TEST_TIMEOUT))
            .await
            .unwrap()
            .expect("timed out waiting for a decision request")
    }
}

/// Subtasks that immediately return the given codes.
pub fn codes(codes: &[SubtaskCode]) -> Vec<SubtaskCallback> {
    codes.iter().map(|&c| subtask(move |_| c)).collect()
}

/// A subtask that sleeps before returning `code`.
pub fn sleepy(ms: u64, code: SubtaskCode) -> SubtaskCallback {
    subtask(move |_| {
        std::thread::sleep(Duration::from_millis(ms));
        code
    })
}

pub fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Records which composite tasks have subtasks running, per queue.
#[derive(Default)]
pub struct ConcurrencyTracker {
    running: Mutex<HashMap<QueueId, HashMap<TaskId, usize>>>,
    same_queue_overlaps: AtomicUsize,
    peak_busy_queues: AtomicUsize,
}

impl ConcurrencyTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A subtask that registers itself for `ms` milliseconds.
    pub fn subtask(self: &Arc<Self>, ms: u64) -> SubtaskCallback {
        let tracker = Arc::clone(self);
        subtask(move |ctx| {
            tracker.enter(ctx.queue(), ctx.task());
            std::thread::sleep(Duration::from_millis(ms));
            tracker.exit(ctx.queue(), ctx.task());
            0
        })
    }

    fn enter(&self, queue: &QueueId, task: TaskId) {
        let mut running = self.running.lock().unwrap();
        let tasks = running.entry(queue.clone()).or_default();
        *tasks.entry(task).or_default() += 1;
        if tasks.len() > 1 {
            self.same_queue_overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let busy = running.values().filter(|t| !t.is_empty()).count();
        self.peak_busy_queues.fetch_max(busy, Ordering::SeqCst);
    }

    fn exit(&self, queue: &QueueId, task: TaskId) {
        let mut running = self.running.lock().unwrap();
        if let Some(tasks) = running.get_mut(queue) {
            if let Some(count) = tasks.get_mut(&task) {
                *count -= 1;
                if *count == 0 {
                    tasks.remove(&task);
                }
            }
        }
    }

    pub fn same_queue_overlaps(&self) -> usize {
        self.same_queue_overlaps.load(Ordering::SeqCst)
    }

    pub fn peak_busy_queues(&self) -> usize {
        self.peak_busy_queues.load(Ordering::SeqCst)
    }
}

/// Config with short timeouts over `machines` simulated machines.
pub fn test_config(machines: &[&str]) -> Config {
    Config {
        queues: vec!["A".into(), "B".into()],
        max_workers: 4,
        decision_timeout_secs: 5,
        confirm_answer: "YES".into(),
        history_limit: 100,
        machines: machines
            .iter()
            .enumerate()
            .map(|(i, name)| MachineConfig {
                line_id: i + 1,
                ..MachineConfig::simulated(name)
            })
            .collect(),
    }
}

/// A controller plus direct handles to its simulated machines.
pub struct Cell {
    pub controller: Controller,
    pub requests: Receiver<DecisionRequest>,
    pub machines: Vec<Arc<SimulatedMachine>>,
}

impl Cell {
    pub fn new(config: &Config) -> Self {
        let mut fleet = Fleet::new();
        let mut machines = Vec::new();
        for mc in &config.machines {
            let machine = Arc::new(SimulatedMachine::new(mc));
            fleet.insert(machine.clone(), mc.line_id).unwrap();
            machines.push(machine);
        }
        let (controller, requests) = Controller::start(config, fleet).unwrap();
        Self {
            controller,
            requests,
            machines,
        }
    }
}
