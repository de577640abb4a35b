use thiserror::Error;

use crate::scheduler::{SubtaskStatus, TaskStatus};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Subtask not found: {0}")]
    UnknownSubtask(String),

    #[error("Subtask {subtask_id} is {status}, not awaiting a result")]
    NotAwaitingResult {
        subtask_id: String,
        status: SubtaskStatus,
    },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Subtask {subtask_id} cannot move from {from} to {to}")]
    InvalidSubtaskTransition {
        subtask_id: String,
        from: SubtaskStatus,
        to: SubtaskStatus,
    },

    #[error("Work unit error: {0}")]
    WorkUnit(String),

    #[error("Resource distribution error: {0}")]
    Distribution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// True for lookup misses on ids the caller expected to exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::UnknownTask(_) | SchedulerError::UnknownSubtask(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
