pub mod config;
pub mod error;
pub mod log;
pub mod util;

// Queue orchestration core and the machine application on top of it
pub mod machine;
pub mod orchestration;

pub use error::{Error, Result};
pub use orchestration::{
    subtask, Orchestrator, OrchestratorOptions, QueueId, Status, SubtaskCode, TaskId,
};
