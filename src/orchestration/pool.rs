//! Worker execution pool for subtask callbacks.
//!
//! The `WorkerPool` runs each callback on the runtime's blocking threads,
//! at most `max_workers` at a time, and reports every outcome back to the
//! dispatcher exactly once as a `DispatchEvent`. A callback that panics is
//! reported with `SUBTASK_PANICKED`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};

use super::queue::QueueId;
use super::status::{SubtaskCode, SUBTASK_PANICKED};
use super::task::{SubtaskCallback, SubtaskContext, SubtaskHandle, TaskId};
use crate::util::blocking;
use crate::{vlog_error, vlog_trace};

/// Events flowing from workers back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A subtask body returned (or panicked).
    SubtaskFinished {
        queue: QueueId,
        task: TaskId,
        index: usize,
        code: SubtaskCode,
    },
}

/// Bounded pool of subtask workers.
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    max_workers: usize,
    active: Arc<AtomicUsize>,
    event_tx: mpsc::UnboundedSender<DispatchEvent>,
}

impl WorkerPool {
    /// Create a pool that spawns onto `runtime`.
    ///
    /// # Arguments
    ///
    /// * `runtime` - Runtime whose blocking threads execute callbacks
    /// * `max_workers` - Maximum number of callbacks running at once (at least 1)
    /// * `event_tx` - Channel for reporting finished subtasks
    pub fn new(
        runtime: Handle,
        max_workers: usize,
        event_tx: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            active: Arc::new(AtomicUsize::new(0)),
            event_tx,
        }
    }

    /// Submit one callback. Never blocks; the callback waits for a free
    /// worker slot inside the pool.
    pub fn submit(&self, callback: SubtaskCallback, ctx: SubtaskContext) -> SubtaskHandle {
        let index = ctx.index();
        let queue = ctx.queue().clone();
        let task = ctx.task();
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        let event_tx = self.event_tx.clone();

        let join = self.runtime.spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            active.fetch_add(1, Ordering::SeqCst);

            let code = match blocking(move || Ok(callback(ctx))).await {
                Ok(code) => code,
                Err(e) => {
                    vlog_error!(
                        "Subtask {}/{}#{} panicked: {}",
                        queue,
                        task.short(),
                        index,
                        e
                    );
                    SUBTASK_PANICKED
                }
            };

            active.fetch_sub(1, Ordering::SeqCst);
            vlog_trace!("Subtask {}/{}#{} finished code={}", queue, task.short(), index, code);
            let _ = event_tx.send(DispatchEvent::SubtaskFinished {
                queue,
                task,
                index,
                code,
            });
        });

        SubtaskHandle::new(index, join)
    }

    /// Number of callbacks currently executing.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Check if a newly submitted callback would start immediately.
    pub fn has_capacity(&self) -> bool {
        self.permits.available_permits() > 0
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}
