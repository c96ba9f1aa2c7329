//! Typed completion-handler table.
//!
//! Handlers are registered once, before the orchestrator starts, under an
//! identifier from a closed set chosen by the owning application (usually
//! an enum). Enqueue validates the identifier, so a retired task always has
//! a handler to run.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use super::dispatcher::Orchestrator;
use super::queue::QueueId;
use super::status::Status;
use super::task::TaskId;
use crate::{Error, Result};

/// Identifier type for completion handlers.
pub trait HandlerKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> HandlerKey for T where T: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

/// A retired composite task, as seen by its completion handler.
#[derive(Debug, Clone)]
pub struct Completion<H> {
    pub queue: QueueId,
    pub task: TaskId,
    /// Enqueue order across the orchestrator, starting at 1.
    pub seq: u64,
    pub handler: H,
    pub status: Status,
}

/// Runs on the dispatch actor, never on a worker thread, and without the
/// queue lock held. The orchestrator handle lets a handler enqueue
/// follow-up work, including into its own queue.
pub type CompletionHandler<H> = Arc<dyn Fn(&Orchestrator<H>, &Completion<H>) + Send + Sync>;

pub struct HandlerTable<H> {
    handlers: HashMap<H, CompletionHandler<H>>,
}

impl<H: HandlerKey> HandlerTable<H> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, id: H, handler: F) -> Result<()>
    where
        F: Fn(&Orchestrator<H>, &Completion<H>) + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&id) {
            return Err(Error::DuplicateHandler(format!("{:?}", id)));
        }
        self.handlers.insert(id, Arc::new(handler));
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with<F>(mut self, id: H, handler: F) -> Result<Self>
    where
        F: Fn(&Orchestrator<H>, &Completion<H>) + Send + Sync + 'static,
    {
        self.register(id, handler)?;
        Ok(self)
    }

    pub fn contains(&self, id: &H) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn get(&self, id: &H) -> Option<&CompletionHandler<H>> {
        self.handlers.get(id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<H: HandlerKey> Default for HandlerTable<H> {
    fn default() -> Self {
        Self::new()
    }
}
