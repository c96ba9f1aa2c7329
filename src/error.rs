use thiserror::Error;

use crate::orchestration::{DecisionKey, QueueId, SubtaskCode};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(QueueId),

    #[error("Queue already registered: {0}")]
    DuplicateQueue(QueueId),

    #[error("Composite task for queue {queue} has no subtasks")]
    EmptyTaskSpec { queue: QueueId },

    #[error("Unknown completion handler: {0}")]
    UnknownHandler(String),

    #[error("Completion handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("Subtask {index} failed with code {code}")]
    SubtaskFailure { index: usize, code: SubtaskCode },

    #[error("No decision posted for {key} within {timeout:?}")]
    RendezvousTimeout {
        key: DecisionKey,
        timeout: std::time::Duration,
    },

    #[error("No subtask is waiting for a decision at {0}")]
    DecisionNotPending(String),

    #[error("Orchestrator is shut down")]
    Shutdown,

    #[error("Machine error: {0}")]
    Machine(String),

    #[error("Machine not found: {0}")]
    MachineNotFound(String),
}

impl Error {
    /// True for the orchestration-level errors that `enqueue` reports
    /// synchronously without touching any queue.
    pub fn is_rejected_enqueue(&self) -> bool {
        matches!(
            self,
            Error::UnknownQueue(_)
                | Error::EmptyTaskSpec { .. }
                | Error::UnknownHandler(_)
                | Error::Shutdown
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
