//! Composite tasks and the subtask callbacks they fan out.
//!
//! A composite task is a fixed list of independent subtasks joined by a
//! completion barrier. Callbacks are consumed when the task is dispatched;
//! from then on the task only tracks execution handles, the completion
//! counter and the aggregated `Status`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::queue::QueueId;
use super::rendezvous::{Decision, DecisionKey, RendezvousBoard};
use super::status::{Status, SubtaskCode};
use crate::{vlog_warn, Result};

/// Unique identifier for a composite task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One unit of work inside a composite task.
///
/// Runs on a worker thread and returns its outcome code. The context gives
/// the body its identity and access to its rendezvous slot.
pub type SubtaskCallback = Box<dyn FnOnce(SubtaskContext) -> SubtaskCode + Send + 'static>;

/// Box a closure as a `SubtaskCallback`.
pub fn subtask<F>(f: F) -> SubtaskCallback
where
    F: FnOnce(SubtaskContext) -> SubtaskCode + Send + 'static,
{
    Box::new(f)
}

/// What a running subtask knows about itself.
#[derive(Clone)]
pub struct SubtaskContext {
    key: DecisionKey,
    board: Arc<RendezvousBoard>,
    decision_timeout: Option<Duration>,
}

impl SubtaskContext {
    pub(crate) fn new(
        key: DecisionKey,
        board: Arc<RendezvousBoard>,
        decision_timeout: Option<Duration>,
    ) -> Self {
        Self {
            key,
            board,
            decision_timeout,
        }
    }

    pub fn queue(&self) -> &QueueId {
        &self.key.queue
    }

    pub fn task(&self) -> TaskId {
        self.key.task
    }

    pub fn index(&self) -> usize {
        self.key.index
    }

    pub fn key(&self) -> &DecisionKey {
        &self.key
    }

    /// Ask the external actor to choose among `options` and wait for the answer.
    ///
    /// May suspend awaiting external input. The calling worker slot stays
    /// occupied until the decision arrives or the orchestrator's decision
    /// timeout elapses (`Error::RendezvousTimeout`).
    pub fn request_decision(&self, options: Vec<String>) -> Result<Decision> {
        self.request_decision_within(options, self.decision_timeout)
    }

    /// Like `request_decision` with an explicit bound. `None` waits forever.
    pub fn request_decision_within(
        &self,
        options: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<Decision> {
        self.board.await_decision(self.key.clone(), options, timeout)
    }
}

impl std::fmt::Debug for SubtaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtaskContext")
            .field("key", &self.key)
            .field("decision_timeout", &self.decision_timeout)
            .finish()
    }
}

/// Execution handle for one dispatched subtask.
#[derive(Debug)]
pub struct SubtaskHandle {
    pub index: usize,
    join: JoinHandle<()>,
}

impl SubtaskHandle {
    pub(crate) fn new(index: usize, join: JoinHandle<()>) -> Self {
        Self { index, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// A unit of enqueued work, exclusively owned by its queue until retired.
pub struct CompositeTask<H> {
    pub(crate) id: TaskId,
    pub(crate) seq: u64,
    pub(crate) handler: H,
    callbacks: Vec<SubtaskCallback>,
    handles: Vec<SubtaskHandle>,
    reported: Vec<bool>,
    completed: usize,
    status: Status,
    dispatched: bool,
}

impl<H> CompositeTask<H> {
    pub(crate) fn new(seq: u64, callbacks: Vec<SubtaskCallback>, handler: H) -> Self {
        let count = callbacks.len();
        Self {
            id: TaskId::new(),
            seq,
            handler,
            callbacks,
            handles: Vec::with_capacity(count),
            reported: vec![false; count],
            completed: 0,
            status: Status::new(count),
            dispatched: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn subtask_count(&self) -> usize {
        self.status.len()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn handles(&self) -> &[SubtaskHandle] {
        &self.handles
    }

    /// Hand the callbacks over for dispatch. Only the first call yields any.
    pub(crate) fn take_callbacks(&mut self) -> Vec<SubtaskCallback> {
        self.dispatched = true;
        std::mem::take(&mut self.callbacks)
    }

    pub(crate) fn attach_handle(&mut self, handle: SubtaskHandle) {
        self.handles.push(handle);
    }

    /// Record one subtask outcome. Returns true once every subtask has
    /// reported. A second report for the same index is ignored.
    pub(crate) fn record_completion(&mut self, index: usize, code: SubtaskCode) -> bool {
        match self.reported.get_mut(index) {
            Some(seen) if !*seen => {
                *seen = true;
                self.status.record(index, code);
                self.completed += 1;
            }
            _ => {
                vlog_warn!(
                    "Ignoring duplicate or out-of-range completion for task {} subtask {}",
                    self.id.short(),
                    index
                );
            }
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.subtask_count()
    }

    pub(crate) fn into_status(self) -> Status {
        self.status
    }
}

impl<H: std::fmt::Debug> std::fmt::Debug for CompositeTask<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeTask")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("handler", &self.handler)
            .field("completed", &self.completed)
            .field("status", &self.status)
            .field("dispatched", &self.dispatched)
            .finish()
    }
}
