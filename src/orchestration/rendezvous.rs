//! Blocking handshake between a subtask and an external decision maker.
//!
//! Each queue owns a `RendezvousBoard`. A subtask that needs a decision
//! opens a slot on its queue's board keyed by (queue, task, subtask index),
//! publishes a `DecisionRequest`, and blocks on that slot alone. Posting a
//! decision wakes exactly the addressed slot, so two subtasks of one
//! composite task can wait at the same time without stealing each other's
//! answers.
//!
//! The board's lock is independent of the registry lock: a blocked subtask
//! never holds anything the dispatcher needs.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::queue::QueueId;
use super::task::TaskId;
use crate::util::lock;
use crate::{vlog, vlog_debug, vlog_warn, Error, Result};

/// Payload field holding the decision itself.
pub const ANSWER_FIELD: &str = "ANSWER";
/// Payload field naming the machine the operator picked.
pub const MACHINE_NAME_FIELD: &str = "MACHINE_NAME";

/// Address of one rendezvous slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionKey {
    pub queue: QueueId,
    pub task: TaskId,
    pub index: usize,
}

impl std::fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.queue, self.task.short(), self.index)
    }
}

/// Emitted toward the external actor when a subtask starts waiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub key: DecisionKey,
    pub options: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

/// Fields posted by the external actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    fields: HashMap<String, String>,
}

impl Decision {
    pub fn new(fields: HashMap<String, String>) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn answer(&self) -> Option<&str> {
        self.get(ANSWER_FIELD)
    }

    pub fn machine_name(&self) -> Option<&str> {
        self.get(MACHINE_NAME_FIELD)
    }

    /// True iff ANSWER equals `affirmative` exactly.
    pub fn is_affirmative(&self, affirmative: &str) -> bool {
        self.answer() == Some(affirmative)
    }

    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    pub fn into_fields(self) -> HashMap<String, String> {
        self.fields
    }
}

#[derive(Default)]
struct SlotState {
    signaled: bool,
    payload: HashMap<String, String>,
}

/// Wait/signal pair for a single waiter.
#[derive(Default)]
struct RendezvousSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl RendezvousSlot {
    fn signal(&self, fields: HashMap<String, String>) {
        let mut state = lock(&self.state);
        state.payload = fields;
        state.signaled = true;
        self.cond.notify_one();
    }

    /// Wait until signaled or until `deadline`. Returns the payload if
    /// signaled.
    fn wait_until(&self, deadline: Option<Instant>) -> Option<HashMap<String, String>> {
        let mut state = lock(&self.state);
        while !state.signaled {
            match deadline {
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    state = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }
        Some(std::mem::take(&mut state.payload))
    }
}

/// Per-queue set of open rendezvous slots, in arrival order.
pub struct RendezvousBoard {
    queue: QueueId,
    waiters: Mutex<Vec<(DecisionKey, Arc<RendezvousSlot>)>>,
    requests: Sender<DecisionRequest>,
}

impl RendezvousBoard {
    pub(crate) fn new(queue: QueueId, requests: Sender<DecisionRequest>) -> Self {
        Self {
            queue,
            waiters: Mutex::new(Vec::new()),
            requests,
        }
    }

    pub fn queue(&self) -> &QueueId {
        &self.queue
    }

    /// Keys of subtasks currently blocked on this board, oldest first.
    pub fn pending(&self) -> Vec<DecisionKey> {
        lock(&self.waiters).iter().map(|(k, _)| k.clone()).collect()
    }

    /// Open a slot for `key`, publish the request and block until answered.
    ///
    /// May suspend awaiting external input for up to `timeout`, or forever
    /// when `timeout` is `None`.
    pub(crate) fn await_decision(
        &self,
        key: DecisionKey,
        options: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<Decision> {
        let slot = Arc::new(RendezvousSlot::default());
        {
            let mut waiters = lock(&self.waiters);
            if waiters.iter().any(|(k, _)| *k == key) {
                return Err(Error::Validation(format!(
                    "subtask {} is already waiting for a decision",
                    key
                )));
            }
            waiters.push((key.clone(), Arc::clone(&slot)));
        }

        vlog!("Decision requested for {} options={:?}", key, options);
        let request = DecisionRequest {
            key: key.clone(),
            options,
            requested_at: Utc::now(),
        };
        if self.requests.send(request).is_err() {
            vlog_warn!("No decision listener for {}; waiting for a direct post", key);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        if let Some(payload) = slot.wait_until(deadline) {
            vlog_debug!("Decision received for {}", key);
            return Ok(Decision::new(payload));
        }

        // Timed out. If a poster already claimed the slot its signal is
        // imminent, so take it; otherwise withdraw.
        let claimed = {
            let mut waiters = lock(&self.waiters);
            match waiters.iter().position(|(k, _)| *k == key) {
                Some(pos) => {
                    waiters.remove(pos);
                    false
                }
                None => true,
            }
        };
        if claimed {
            if let Some(payload) = slot.wait_until(None) {
                return Ok(Decision::new(payload));
            }
        }

        let timeout = timeout.unwrap_or_default();
        vlog_warn!("Decision for {} timed out after {:?}", key, timeout);
        Err(Error::RendezvousTimeout { key, timeout })
    }

    /// Deliver `fields` to the subtask waiting at `key`.
    pub fn post(&self, key: &DecisionKey, fields: HashMap<String, String>) -> Result<()> {
        let slot = {
            let mut waiters = lock(&self.waiters);
            let pos = waiters
                .iter()
                .position(|(k, _)| k == key)
                .ok_or_else(|| Error::DecisionNotPending(key.to_string()))?;
            waiters.remove(pos).1
        };
        vlog!("Decision posted for {}", key);
        slot.signal(fields);
        Ok(())
    }

    /// Deliver `fields` to the longest-waiting subtask on this queue.
    pub fn post_oldest(&self, fields: HashMap<String, String>) -> Result<DecisionKey> {
        let (key, slot) = {
            let mut waiters = lock(&self.waiters);
            if waiters.is_empty() {
                return Err(Error::DecisionNotPending(self.queue.to_string()));
            }
            waiters.remove(0)
        };
        vlog!("Decision posted for {} (oldest on queue)", key);
        slot.signal(fields);
        Ok(key)
    }
}
