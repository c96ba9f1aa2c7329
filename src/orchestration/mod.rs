//! Queue-based task orchestration.
//!
//! Named FIFO queues of composite tasks. Each composite task fans its
//! subtasks out to a bounded worker pool, waits for all of them, aggregates
//! their codes into a `Status` and hands it to a typed completion handler.
//! Tasks on one queue are strictly serialized; tasks on different queues
//! overlap freely. Subtasks that need an external decision block on their
//! queue's rendezvous board until one is posted.

mod dispatcher;
mod handlers;
mod pool;
mod queue;
mod registry;
mod rendezvous;
mod status;
mod task;

pub use dispatcher::{Orchestrator, OrchestratorEvent, OrchestratorOptions};
pub use handlers::{Completion, CompletionHandler, HandlerKey, HandlerTable};
pub use pool::{DispatchEvent, WorkerPool};
pub use queue::{Queue, QueueId, QueueSnapshot, Trigger};
pub use registry::{QueueRegistry, QueueRegistryBuilder};
pub use rendezvous::{
    Decision, DecisionKey, DecisionRequest, RendezvousBoard, ANSWER_FIELD, MACHINE_NAME_FIELD,
};
pub use status::{Status, SubtaskCode, SUBTASK_OK, SUBTASK_PANICKED};
pub use task::{subtask, CompositeTask, SubtaskCallback, SubtaskContext, SubtaskHandle, TaskId};
