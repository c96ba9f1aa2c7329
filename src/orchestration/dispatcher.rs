//! Enqueue / drain protocol and completion dispatch.
//!
//! The `Orchestrator` serializes composite tasks per queue while fanning
//! each task's subtasks out to the worker pool. Workers report back over a
//! channel to a dispatch actor (a tokio task), which counts completions,
//! retires finished heads, runs their completion handlers and dispatches
//! the next head.
//!
//! Per queue:
//! - tasks retire, and their handlers run, in enqueue order;
//! - at most one task has subtasks in flight;
//! - a task is popped exactly once, after its last subtask reported.
//!
//! Handlers run on the dispatch actor with no lock held, so they may enqueue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handlers::{Completion, HandlerKey, HandlerTable};
use super::pool::{DispatchEvent, WorkerPool};
use super::queue::{Queue, QueueId, QueueSnapshot};
use super::registry::{QueueRegistry, QueueRegistryBuilder};
use super::rendezvous::{DecisionKey, DecisionRequest};
use super::status::{Status, SubtaskCode};
use super::task::{CompositeTask, SubtaskCallback, SubtaskContext, TaskId};
use crate::util::lock;
use crate::{vlog, vlog_debug, vlog_error, vlog_trace, vlog_warn, Error, Result};

/// Tuning for a started orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Upper bound on concurrently running subtasks across all queues.
    pub max_workers: usize,
    /// Default bound for `SubtaskContext::request_decision`. `None` waits
    /// indefinitely.
    pub decision_timeout: Option<Duration>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_workers: 8,
            decision_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Lifecycle notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorEvent {
    /// A task became head and its subtasks were handed to the pool.
    Dispatched {
        queue: QueueId,
        task: TaskId,
        seq: u64,
        subtasks: usize,
    },
    SubtaskFinished {
        queue: QueueId,
        task: TaskId,
        index: usize,
        code: SubtaskCode,
    },
    /// Emitted after the completion handler returned.
    Retired {
        queue: QueueId,
        task: TaskId,
        seq: u64,
        status: Status,
    },
    /// The queue drained and its trigger went idle.
    Idle { queue: QueueId },
}

struct Inner<H> {
    registry: QueueRegistry<H>,
    handlers: HandlerTable<H>,
    pool: WorkerPool,
    decision_timeout: Option<Duration>,
    next_seq: AtomicU64,
    shut_down: AtomicBool,
    cancel: CancellationToken,
    observers: Mutex<Vec<mpsc::UnboundedSender<OrchestratorEvent>>>,
}

/// Cloneable handle to a running orchestrator.
pub struct Orchestrator<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for Orchestrator<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: HandlerKey> Orchestrator<H> {
    /// Freeze the registry and start the dispatch actor on the current
    /// tokio runtime.
    ///
    /// Returns the handle and the stream of decision requests raised by
    /// subtasks, to be served by an external actor.
    ///
    /// # Errors
    ///
    /// `Error::Validation` when called outside a tokio runtime.
    pub fn start(
        registry: QueueRegistryBuilder<H>,
        handlers: HandlerTable<H>,
        options: OrchestratorOptions,
    ) -> Result<(Self, Receiver<DecisionRequest>)> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Validation(format!("orchestrator needs a tokio runtime: {}", e)))?;
        let (registry, requests) = registry.build();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(runtime.clone(), options.max_workers, event_tx);

        vlog!(
            "Orchestrator starting: queues={:?} handlers={} max_workers={}",
            registry.names(),
            handlers.len(),
            pool.max_workers()
        );

        let inner = Arc::new(Inner {
            registry,
            handlers,
            pool,
            decision_timeout: options.decision_timeout,
            next_seq: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            observers: Mutex::new(Vec::new()),
        });

        runtime.spawn(dispatch_loop(
            Arc::downgrade(&inner),
            event_rx,
            inner.cancel.clone(),
        ));

        Ok((Self { inner }, requests))
    }

    /// Enqueue a composite task made of `subtasks` on `queue`.
    ///
    /// If the queue was idle the task is dispatched immediately. Rejections
    /// (`UnknownQueue`, `EmptyTaskSpec`, `UnknownHandler`, `Shutdown`) leave
    /// every queue untouched.
    pub fn enqueue(
        &self,
        queue: &str,
        subtasks: Vec<SubtaskCallback>,
        handler: H,
    ) -> Result<TaskId> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let queue_id = self.inner.registry.lookup(queue)?.clone();
        if subtasks.is_empty() {
            return Err(Error::EmptyTaskSpec { queue: queue_id });
        }
        if !self.inner.handlers.contains(&handler) {
            return Err(Error::UnknownHandler(format!("{:?}", handler)));
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let task = CompositeTask::new(seq, subtasks, handler);
        let task_id = task.id();
        let count = task.subtask_count();

        let mut queues = self.inner.registry.lock();
        let q = queues
            .get_mut(&queue_id)
            .ok_or_else(|| Error::UnknownQueue(queue_id.clone()))?;
        let start_drain = q.push(task);
        vlog_debug!(
            "Enqueued task {} seq={} on {} ({} subtasks, handler {:?}, pending={})",
            task_id.short(),
            seq,
            queue_id,
            count,
            handler,
            q.len()
        );
        if start_drain {
            self.dispatch_head(q);
        }
        Ok(task_id)
    }

    /// Hand the head task's callbacks to the pool. Caller holds the lock.
    fn dispatch_head(&self, queue: &mut Queue<H>) {
        let queue_id = queue.id().clone();
        let board = match self.inner.registry.board(queue_id.as_str()) {
            Ok(board) => Arc::clone(board),
            Err(e) => {
                vlog_error!("Cannot dispatch on {}: {}", queue_id, e);
                return;
            }
        };
        let Some(head) = queue.head_mut() else {
            return;
        };
        if head.is_dispatched() {
            return;
        }

        let task_id = head.id();
        let seq = head.seq;
        let callbacks = head.take_callbacks();
        let subtasks = callbacks.len();
        for (index, callback) in callbacks.into_iter().enumerate() {
            let key = DecisionKey {
                queue: queue_id.clone(),
                task: task_id,
                index,
            };
            let ctx = SubtaskContext::new(key, Arc::clone(&board), self.inner.decision_timeout);
            let handle = self.inner.pool.submit(callback, ctx);
            head.attach_handle(handle);
        }

        vlog_debug!(
            "Dispatched task {} seq={} on {} ({} subtasks)",
            task_id.short(),
            seq,
            queue_id,
            subtasks
        );
        self.emit(OrchestratorEvent::Dispatched {
            queue: queue_id,
            task: task_id,
            seq,
            subtasks,
        });
    }

    /// Record one subtask outcome; retire and drain if it was the last.
    fn on_subtask_finished(&self, queue: QueueId, task: TaskId, index: usize, code: SubtaskCode) {
        let retired = {
            let mut queues = self.inner.registry.lock();
            let Some(q) = queues.get_mut(&queue) else {
                vlog_warn!("Completion for unregistered queue {}", queue);
                return;
            };
            let Some(head) = q.head_mut() else {
                vlog_warn!("Completion for task {} on empty queue {}", task.short(), queue);
                return;
            };
            if head.id() != task {
                vlog_warn!(
                    "Stale completion for task {} on {} (head is {})",
                    task.short(),
                    queue,
                    head.id().short()
                );
                return;
            }
            let done = head.record_completion(index, code);
            vlog_trace!(
                "Task {} on {}: subtask {} code={} ({}/{})",
                task.short(),
                queue,
                index,
                code,
                head.completed(),
                head.subtask_count()
            );
            if done {
                q.retire(task)
            } else {
                None
            }
        };

        self.emit(OrchestratorEvent::SubtaskFinished {
            queue: queue.clone(),
            task,
            index,
            code,
        });

        if let Some(retired) = retired {
            self.complete(&queue, retired);
            self.drain(&queue);
        }
    }

    /// Run the retired task's completion handler. No lock is held here.
    fn complete(&self, queue: &QueueId, task: CompositeTask<H>) {
        let completion = Completion {
            queue: queue.clone(),
            task: task.id(),
            seq: task.seq,
            handler: task.handler,
            status: task.into_status(),
        };
        vlog_debug!(
            "Retired task {} seq={} on {} status={} successful={}",
            completion.task.short(),
            completion.seq,
            queue,
            completion.status,
            completion.status.successful()
        );

        match self.inner.handlers.get(&completion.handler) {
            Some(handler) => {
                let handler = Arc::clone(handler);
                if catch_unwind(AssertUnwindSafe(|| handler(self, &completion))).is_err() {
                    vlog_error!(
                        "Completion handler {:?} panicked for task {}",
                        completion.handler,
                        completion.task.short()
                    );
                }
            }
            None => vlog_error!("No completion handler {:?}", completion.handler),
        }

        self.emit(OrchestratorEvent::Retired {
            queue: completion.queue,
            task: completion.task,
            seq: completion.seq,
            status: completion.status,
        });
    }

    /// Dispatch the new head, or mark the queue idle if it is empty.
    fn drain(&self, queue: &QueueId) {
        let mut queues = self.inner.registry.lock();
        let Some(q) = queues.get_mut(queue) else {
            return;
        };
        if q.settle() {
            drop(queues);
            vlog_trace!("Queue {} idle", queue);
            self.emit(OrchestratorEvent::Idle {
                queue: queue.clone(),
            });
        } else {
            self.dispatch_head(q);
        }
    }

    /// Deliver a decision to the subtask waiting at `key`.
    pub fn post_decision(&self, key: &DecisionKey, fields: HashMap<String, String>) -> Result<()> {
        self.inner.registry.board(key.queue.as_str())?.post(key, fields)
    }

    /// Deliver a decision to the longest-waiting subtask on `queue`.
    pub fn post_decision_to_queue(
        &self,
        queue: &str,
        fields: HashMap<String, String>,
    ) -> Result<DecisionKey> {
        self.inner.registry.board(queue)?.post_oldest(fields)
    }

    /// Subtasks currently blocked on `queue`'s board, oldest first.
    pub fn pending_decisions(&self, queue: &str) -> Result<Vec<DecisionKey>> {
        Ok(self.inner.registry.board(queue)?.pending())
    }

    pub fn queue_snapshot(&self, queue: &str) -> Result<QueueSnapshot> {
        self.inner.registry.snapshot(queue)
    }

    pub fn queues(&self) -> &[QueueId] {
        self.inner.registry.names()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.pool.active_count()
    }

    /// Receive every `OrchestratorEvent` emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OrchestratorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.observers).push(tx);
        rx
    }

    fn emit(&self, event: OrchestratorEvent) {
        let mut observers = lock(&self.inner.observers);
        observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Reject further enqueues and stop the dispatch actor. Subtasks already
    /// running are not cancelled.
    pub fn shutdown(&self) {
        if !self.inner.shut_down.swap(true, Ordering::SeqCst) {
            vlog!("Orchestrator shutting down");
            self.inner.cancel.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

/// The dispatch actor. Holds only a weak reference so dropping every
/// orchestrator handle also ends the loop.
async fn dispatch_loop<H: HandlerKey>(
    inner: Weak<Inner<H>>,
    mut event_rx: mpsc::UnboundedReceiver<DispatchEvent>,
    cancel: CancellationToken,
) {
    vlog_debug!("Dispatch actor started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                vlog_debug!("Dispatch actor cancelled");
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else {
                    vlog_debug!("Dispatch actor: event channel closed");
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let orchestrator = Orchestrator { inner };
                match event {
                    DispatchEvent::SubtaskFinished { queue, task, index, code } => {
                        orchestrator.on_subtask_finished(queue, task, index, code);
                    }
                }
            }
        }
    }
}
