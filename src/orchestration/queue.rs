//! Named FIFO of composite tasks.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::task::{CompositeTask, TaskId};

/// Queue name, unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for QueueId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl std::borrow::Borrow<str> for QueueId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a drain cycle is running on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Idle,
    Active,
}

/// FIFO of composite tasks plus its trigger flag.
///
/// Active iff the head task has been dispatched and not yet retired, or a
/// retired head's successor is about to be dispatched.
pub struct Queue<H> {
    id: QueueId,
    tasks: VecDeque<CompositeTask<H>>,
    trigger: Trigger,
}

impl<H> Queue<H> {
    pub(crate) fn new(id: QueueId) -> Self {
        Self {
            id,
            tasks: VecDeque::new(),
            trigger: Trigger::Idle,
        }
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn head(&self) -> Option<&CompositeTask<H>> {
        self.tasks.front()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut CompositeTask<H>> {
        self.tasks.front_mut()
    }

    /// Append a task. Returns true when the queue was idle and the caller
    /// must start a drain cycle.
    pub(crate) fn push(&mut self, task: CompositeTask<H>) -> bool {
        self.tasks.push_back(task);
        if self.trigger == Trigger::Idle {
            self.trigger = Trigger::Active;
            true
        } else {
            false
        }
    }

    /// Remove the head if it is the given, fully completed task.
    pub(crate) fn retire(&mut self, id: TaskId) -> Option<CompositeTask<H>> {
        match self.tasks.front() {
            Some(head) if head.id == id && head.is_complete() => self.tasks.pop_front(),
            _ => None,
        }
    }

    /// Mark the queue idle if nothing is left to run. Returns true if it
    /// went idle.
    pub(crate) fn settle(&mut self) -> bool {
        if self.tasks.is_empty() {
            self.trigger = Trigger::Idle;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queue: self.id.clone(),
            pending: self.tasks.len(),
            trigger: self.trigger,
            head: self.tasks.front().map(|t| t.id),
        }
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue: QueueId,
    pub pending: usize,
    pub trigger: Trigger,
    pub head: Option<TaskId>,
}
