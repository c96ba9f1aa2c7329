//! Fixed set of named queues, created once at startup.
//!
//! Registration happens on a `QueueRegistryBuilder` during initialization.
//! `build` freezes the name set; from then on lookups read an immutable map
//! without locking, and all queue mutation goes through the registry's one
//! lock. Rendezvous boards sit outside that lock.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::queue::{Queue, QueueId, QueueSnapshot};
use super::rendezvous::{DecisionRequest, RendezvousBoard};
use crate::util::lock;
use crate::{Error, Result};

pub struct QueueRegistryBuilder<H> {
    order: Vec<QueueId>,
    queues: HashMap<QueueId, Queue<H>>,
    boards: HashMap<QueueId, Arc<RendezvousBoard>>,
    requests_tx: Sender<DecisionRequest>,
    requests_rx: Receiver<DecisionRequest>,
}

impl<H> QueueRegistryBuilder<H> {
    pub fn new() -> Self {
        let (requests_tx, requests_rx) = unbounded();
        Self {
            order: Vec::new(),
            queues: HashMap::new(),
            boards: HashMap::new(),
            requests_tx,
            requests_rx,
        }
    }

    /// Create a queue and its rendezvous board under `name`.
    pub fn register(&mut self, name: impl Into<QueueId>) -> Result<&mut Self> {
        let id = name.into();
        if self.queues.contains_key(&id) {
            return Err(Error::DuplicateQueue(id));
        }
        self.queues.insert(id.clone(), Queue::new(id.clone()));
        self.boards.insert(
            id.clone(),
            Arc::new(RendezvousBoard::new(id.clone(), self.requests_tx.clone())),
        );
        self.order.push(id);
        Ok(self)
    }

    /// Register every name in order, failing on the first duplicate.
    pub fn register_all<I, S>(&mut self, names: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<QueueId>,
    {
        for name in names {
            self.register(name)?;
        }
        Ok(self)
    }

    /// Freeze the name set. The receiver yields every decision request
    /// raised by subtasks on any of these queues.
    pub fn build(self) -> (QueueRegistry<H>, Receiver<DecisionRequest>) {
        let registry = QueueRegistry {
            order: self.order,
            boards: self.boards,
            queues: Mutex::new(self.queues),
        };
        (registry, self.requests_rx)
    }
}

impl<H> Default for QueueRegistryBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct QueueRegistry<H> {
    order: Vec<QueueId>,
    boards: HashMap<QueueId, Arc<RendezvousBoard>>,
    queues: Mutex<HashMap<QueueId, Queue<H>>>,
}

impl<H> QueueRegistry<H> {
    pub fn builder() -> QueueRegistryBuilder<H> {
        QueueRegistryBuilder::new()
    }

    /// Registered queue names, in registration order.
    pub fn names(&self) -> &[QueueId] {
        &self.order
    }

    /// Resolve `name` to its registered identifier.
    pub fn lookup(&self, name: &str) -> Result<&QueueId> {
        self.boards
            .get_key_value(name)
            .map(|(id, _)| id)
            .ok_or_else(|| Error::UnknownQueue(QueueId::from(name)))
    }

    pub fn board(&self, name: &str) -> Result<&Arc<RendezvousBoard>> {
        self.boards
            .get(name)
            .ok_or_else(|| Error::UnknownQueue(QueueId::from(name)))
    }

    pub fn snapshot(&self, name: &str) -> Result<QueueSnapshot> {
        let id = self.lookup(name)?;
        let queues = self.lock();
        queues
            .get(id)
            .map(Queue::snapshot)
            .ok_or_else(|| Error::UnknownQueue(id.clone()))
    }

    /// The registry lock. Hold it only for short, non-blocking sections.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<QueueId, Queue<H>>> {
        lock(&self.queues)
    }
}
