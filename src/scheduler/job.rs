use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where providers should send results for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOwner {
    pub key_id: String,
    pub node_name: String,
    pub address: String,
    pub port: u16,
}

/// Public description of a task, advertised to providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeader {
    pub task_id: String,
    pub owner: TaskOwner,
    pub environment: String,
    /// Total size of the resources a provider has to fetch, in bytes
    pub resource_size: u64,
    /// Peak memory a subtask is expected to use, in bytes
    pub estimated_memory: u64,
    /// Highest price the owner pays per second of computation
    pub max_price: u64,
    /// Seconds the task has left before the sweep drops it
    pub ttl: f64,
    /// Seconds a provider gets to deliver a single subtask
    pub subtask_timeout: f64,
    pub last_checking: DateTime<Utc>,
}

impl TaskHeader {
    pub fn new(task_id: impl Into<String>, ttl: f64, subtask_timeout: f64) -> Self {
        Self {
            task_id: task_id.into(),
            owner: TaskOwner::default(),
            environment: "default".to_string(),
            resource_size: 0,
            estimated_memory: 0,
            max_price: 0,
            ttl,
            subtask_timeout,
            last_checking: Utc::now(),
        }
    }

    pub fn with_max_price(mut self, max_price: u64) -> Self {
        self.max_price = max_price;
        self
    }

    pub fn with_resource_size(mut self, bytes: u64) -> Self {
        self.resource_size = bytes;
        self
    }

    pub fn with_estimated_memory(mut self, bytes: u64) -> Self {
        self.estimated_memory = bytes;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    NotStarted,
    Waiting,
    Starting,
    Computing,
    Paused,
    Finished,
    Aborted,
    Timeout,
}

impl TaskStatus {
    /// Statuses in which the task accepts offers and its clocks run.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Waiting | TaskStatus::Starting | TaskStatus::Computing
        )
    }

    pub fn is_completed(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Aborted | TaskStatus::Timeout
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (NotStarted, Waiting)
                | (Waiting, Starting)
                | (Starting, Computing)
                | (Computing, Finished)
                | (Waiting | Starting | Computing, Paused)
                | (Paused, Starting)
                | (NotStarted | Waiting | Starting | Computing | Paused, Aborted)
                | (Waiting | Starting | Computing, Timeout)
                // restart of the whole task
                | (Starting | Computing | Paused | Finished, Waiting)
                // restart of a single subtask reopens the task
                | (Waiting | Finished, Computing)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::NotStarted => "notStarted",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Starting => "starting",
            TaskStatus::Computing => "computing",
            TaskStatus::Paused => "paused",
            TaskStatus::Finished => "finished",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Timeout => "timeout",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubtaskStatus {
    Waiting,
    Starting,
    Finished,
    Failure,
    /// Re-issued by an operator
    Restarted,
    /// Re-issued because the assigned node went silent
    Resent,
}

impl SubtaskStatus {
    /// A result or failure report for the subtask is still welcome.
    pub fn awaits_result(self) -> bool {
        matches!(
            self,
            SubtaskStatus::Starting | SubtaskStatus::Restarted | SubtaskStatus::Resent
        )
    }

    /// The slot may be handed to a new provider.
    pub fn is_reissuable(self) -> bool {
        matches!(self, SubtaskStatus::Restarted | SubtaskStatus::Resent)
    }

    pub fn can_transition_to(self, next: SubtaskStatus) -> bool {
        use SubtaskStatus::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Waiting, Starting | Restarted)
                | (Starting, Finished | Failure | Restarted | Resent)
                | (Finished | Failure, Restarted)
                | (Restarted | Resent, Starting | Finished | Failure)
                | (Resent, Restarted)
        )
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubtaskStatus::Waiting => "waiting",
            SubtaskStatus::Starting => "starting",
            SubtaskStatus::Finished => "finished",
            SubtaskStatus::Failure => "failure",
            SubtaskStatus::Restarted => "restarted",
            SubtaskStatus::Resent => "resent",
        };
        write!(f, "{}", name)
    }
}

/// The provider a subtask was handed to, as declared in its offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputerInfo {
    pub node_id: String,
    pub node_name: String,
    pub performance: f64,
    pub ip_address: String,
    pub price: u64,
    pub num_cores: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskState {
    pub subtask_id: String,
    pub status: SubtaskStatus,
    pub progress: f64,
    pub time_started: DateTime<Utc>,
    pub elapsed_time: f64,
    pub remaining_time: f64,
    /// Seconds left before the sweep fails the subtask
    pub ttl: f64,
    pub last_checking: DateTime<Utc>,
    pub value: u64,
    pub computer: Option<ComputerInfo>,
    pub extra_data: Value,
    pub stdout: String,
    pub stderr: String,
    pub results: Vec<String>,
}

impl SubtaskState {
    pub fn assigned(
        subtask_id: String,
        computer: ComputerInfo,
        extra_data: Value,
        timeout: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subtask_id,
            status: SubtaskStatus::Starting,
            progress: 0.0,
            time_started: now,
            elapsed_time: 0.0,
            remaining_time: timeout,
            ttl: timeout,
            last_checking: now,
            value: 0,
            computer: Some(computer),
            extra_data,
            stdout: String::new(),
            stderr: String::new(),
            results: Vec::new(),
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        self.computer.as_ref().map(|c| c.node_id.as_str())
    }

    /// Move to `next` if the transition table allows it.
    pub fn transition(&mut self, next: SubtaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                subtask_id = %self.subtask_id,
                from = %self.status,
                to = %next,
                "Refusing subtask status change"
            );
            return false;
        }
        self.status = next;
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub progress: f64,
    pub time_started: DateTime<Utc>,
    pub elapsed_time: f64,
    pub remaining_time: Option<f64>,
    pub subtask_states: HashMap<String, SubtaskState>,
    pub extra_data: Map<String, Value>,
}

impl TaskState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::NotStarted,
            progress: 0.0,
            time_started: now,
            elapsed_time: 0.0,
            remaining_time: None,
            subtask_states: HashMap::new(),
            extra_data: Map::new(),
        }
    }

    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(from = %self.status, to = %next, "Refusing task status change");
            return false;
        }
        self.status = next;
        true
    }

    /// Subtask slots that were restarted and no longer have a provider.
    pub fn free_slot(&self) -> Option<&str> {
        self.subtask_states
            .values()
            .filter(|ss| ss.status.is_reissuable() && ss.computer.is_none())
            .min_by_key(|ss| ss.time_started)
            .map(|ss| ss.subtask_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn computer(node_id: &str) -> ComputerInfo {
        ComputerInfo {
            node_id: node_id.to_string(),
            node_name: "provider".to_string(),
            performance: 1000.0,
            ip_address: "10.0.0.2".to_string(),
            price: 10,
            num_cores: 4,
        }
    }

    #[test]
    fn task_lifecycle_happy_path() {
        use TaskStatus::*;
        let path = [NotStarted, Waiting, Starting, Computing, Finished];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn task_pause_and_resume() {
        use TaskStatus::*;
        for from in [Waiting, Starting, Computing] {
            assert!(from.can_transition_to(Paused));
        }
        assert!(Paused.can_transition_to(Starting));
        assert!(!Paused.can_transition_to(Computing));
        assert!(!Finished.can_transition_to(Paused));
    }

    #[test]
    fn restart_edges_reopen_task() {
        use TaskStatus::*;
        // restart_task on a finished task
        assert!(Finished.can_transition_to(Waiting));
        // restart_subtask or a resend on a finished task
        assert!(Finished.can_transition_to(Computing));
        // restart_subtask before any result came back
        assert!(Waiting.can_transition_to(Computing));

        assert!(!Finished.can_transition_to(Starting));
        assert!(!NotStarted.can_transition_to(Computing));
    }

    #[test]
    fn terminal_task_statuses_stay_put() {
        use TaskStatus::*;
        for next in [Waiting, Starting, Computing, Paused, Finished] {
            assert!(!Aborted.can_transition_to(next));
            assert!(!Timeout.can_transition_to(next));
        }
        assert!(!Finished.can_transition_to(Timeout));
        assert!(!Paused.can_transition_to(Timeout));
    }

    #[test]
    fn active_and_completed_sets() {
        assert!(TaskStatus::Waiting.is_active());
        assert!(TaskStatus::Computing.is_active());
        assert!(!TaskStatus::Paused.is_active());
        assert!(!TaskStatus::NotStarted.is_active());
        assert!(TaskStatus::Timeout.is_completed());
        assert!(!TaskStatus::Paused.is_completed());
    }

    #[test]
    fn subtask_transitions() {
        use SubtaskStatus::*;
        assert!(Starting.can_transition_to(Finished));
        assert!(Starting.can_transition_to(Failure));
        assert!(Finished.can_transition_to(Restarted));
        assert!(Failure.can_transition_to(Restarted));
        assert!(Restarted.can_transition_to(Starting));
        assert!(Resent.can_transition_to(Starting));
        assert!(!Finished.can_transition_to(Starting));
        assert!(!Failure.can_transition_to(Finished));
        assert!(!Finished.can_transition_to(Resent));
    }

    #[test]
    fn awaiting_statuses() {
        assert!(SubtaskStatus::Starting.awaits_result());
        assert!(SubtaskStatus::Restarted.awaits_result());
        assert!(SubtaskStatus::Resent.awaits_result());
        assert!(!SubtaskStatus::Finished.awaits_result());
        assert!(!SubtaskStatus::Failure.awaits_result());
    }

    #[test]
    fn subtask_transition_refuses_illegal_move() {
        let now = Utc::now();
        let mut ss = SubtaskState::assigned("s1".into(), computer("A"), Value::Null, 30.0, now);
        assert!(ss.transition(SubtaskStatus::Finished));
        assert!(!ss.transition(SubtaskStatus::Starting));
        assert_eq!(ss.status, SubtaskStatus::Finished);
    }

    #[test]
    fn assigned_subtask_starts_with_full_ttl() {
        let now = Utc::now();
        let ss = SubtaskState::assigned("s1".into(), computer("A"), Value::Null, 45.0, now);
        assert_eq!(ss.status, SubtaskStatus::Starting);
        assert_eq!(ss.ttl, 45.0);
        assert_eq!(ss.last_checking, now);
        assert_eq!(ss.node_id(), Some("A"));
    }

    #[test]
    fn free_slot_ignores_assigned_restarts() {
        let now = Utc::now();
        let mut state = TaskState::new(now);

        let mut held = SubtaskState::assigned("held".into(), computer("A"), Value::Null, 30.0, now);
        held.status = SubtaskStatus::Restarted;
        state.subtask_states.insert("held".into(), held);
        assert_eq!(state.free_slot(), None);

        let mut free = SubtaskState::assigned("free".into(), computer("B"), Value::Null, 30.0, now);
        free.status = SubtaskStatus::Resent;
        free.computer = None;
        state.subtask_states.insert("free".into(), free);
        assert_eq!(state.free_slot(), Some("free"));
    }

    #[test]
    fn status_display_matches_serde_names() {
        assert_eq!(TaskStatus::NotStarted.to_string(), "notStarted");
        assert_eq!(
            serde_json::to_value(TaskStatus::NotStarted).unwrap(),
            Value::String("notStarted".into())
        );
        assert_eq!(SubtaskStatus::Resent.to_string(), "resent");
    }
}
