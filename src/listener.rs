use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::scheduler::{SubtaskStatus, TaskStatus};

/// Operation that caused a task-level notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOp {
    Created,
    WorkOfferReceived,
    Updated,
    Finished,
    NotAccepted,
    Restarted,
    Paused,
    Resumed,
    Aborted,
    Timeout,
    Deleted,
}

/// Operation that caused a subtask-level notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskOp {
    Assigned,
    Finished,
    NotAccepted,
    Failed,
    Timeout,
    Restarted,
    Resent,
}

/// Observer of task and subtask status changes.
///
/// Statistics and reputation collaborators implement this. Calls are made
/// while the scheduler holds its lock, so implementations must be quick and
/// must not call back into the scheduler.
pub trait EventListener: Send + Sync {
    fn on_task_status_changed(&self, task_id: &str, status: TaskStatus, op: TaskOp);

    fn on_subtask_status_changed(
        &self,
        task_id: &str,
        subtask_id: &str,
        status: SubtaskStatus,
        op: SubtaskOp,
    );
}

/// Listener that writes every notification to the log.
#[derive(Debug, Default, Clone)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_task_status_changed(&self, task_id: &str, status: TaskStatus, op: TaskOp) {
        tracing::info!(task_id, status = %status, op = ?op, "Task updated");
    }

    fn on_subtask_status_changed(
        &self,
        task_id: &str,
        subtask_id: &str,
        status: SubtaskStatus,
        op: SubtaskOp,
    ) {
        tracing::info!(task_id, subtask_id, status = %status, op = ?op, "Subtask updated");
    }
}

/// Fan-out over registered listeners. A panicking listener is logged and skipped.
#[derive(Default, Clone)]
pub(crate) struct Listeners {
    inner: Vec<Arc<dyn EventListener>>,
}

impl Listeners {
    pub(crate) fn push(&mut self, listener: Arc<dyn EventListener>) {
        self.inner.push(listener);
    }

    pub(crate) fn task_changed(&self, task_id: &str, status: TaskStatus, op: TaskOp) {
        for listener in &self.inner {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.on_task_status_changed(task_id, status, op)
            }));
            if outcome.is_err() {
                tracing::error!(task_id, op = ?op, "Event listener panicked");
            }
        }
    }

    pub(crate) fn subtask_changed(
        &self,
        task_id: &str,
        subtask_id: &str,
        status: SubtaskStatus,
        op: SubtaskOp,
    ) {
        for listener in &self.inner {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.on_subtask_status_changed(task_id, subtask_id, status, op)
            }));
            if outcome.is_err() {
                tracing::error!(task_id, subtask_id, op = ?op, "Event listener panicked");
            }
        }
    }
}
