use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::NodeIdentity;
use crate::error::{Result, SchedulerError};
use crate::listener::{EventListener, Listeners, SubtaskOp, TaskOp};
use crate::scheduler::admission::{check_offer, Rejection, WorkOffer};
use crate::scheduler::job::{
    ComputerInfo, SubtaskState, SubtaskStatus, TaskHeader, TaskOwner, TaskState, TaskStatus,
};
use crate::scheduler::registry::{TaskEntry, TaskRegistry};
use crate::scheduler::timeouts::{deadline_after, decay, elapsed_secs, SweepReport};
use crate::work_unit::{Production, SubtaskDefinition, SubtaskRequest, TaskResult, WorkUnit};

const OFFERS_KEY: &str = "offers_received";

/// Amount owed for `elapsed_secs` of work at `price` per second, rounded up.
///
/// Whole seconds are charged in integer arithmetic so large prices stay exact;
/// the result saturates at `u64::MAX`.
pub fn price_for_work(price: u64, elapsed_secs: f64) -> u64 {
    let elapsed = elapsed_secs.max(0.0);
    let whole = elapsed.trunc();
    let fraction = elapsed - whole;
    let charged = u128::from(price)
        .saturating_mul(whole as u128)
        .saturating_add((price as f64 * fraction).ceil() as u128);
    u64::try_from(charged).unwrap_or(u64::MAX)
}

/// Answer to a work offer.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Subtask(SubtaskDefinition),
    /// Refused; the reason is deliberately not disclosed
    NoWork,
    /// The task's work unit wants the node to come back later
    ShouldWait,
    UnknownTask,
}

impl Assignment {
    pub fn is_unknown_task(&self) -> bool {
        matches!(self, Assignment::UnknownTask)
    }

    pub fn subtask(&self) -> Option<&SubtaskDefinition> {
        match self {
            Assignment::Subtask(def) => Some(def),
            _ => None,
        }
    }

    pub fn into_subtask(self) -> Option<SubtaskDefinition> {
        match self {
            Assignment::Subtask(def) => Some(def),
            _ => None,
        }
    }
}

/// Progress snapshot of a task that is still in progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_subtasks: usize,
    pub active_subtasks: usize,
    pub progress: f64,
}

/// Owner of all registered tasks and their subtasks.
///
/// Every method takes `&mut self` or `&self`; callers share a manager behind
/// a single lock (see [`crate::node::RequesterNode`]). Methods with an `_at`
/// suffix take the current time explicitly.
pub struct TaskManager {
    node: NodeIdentity,
    registry: TaskRegistry,
    listeners: Listeners,
}

impl TaskManager {
    pub fn new(node: NodeIdentity) -> Self {
        Self {
            node,
            registry: TaskRegistry::new(),
            listeners: Listeners::default(),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.registry.contains(task_id)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn add_new_task(&mut self, work_unit: Box<dyn WorkUnit>, scratch_dir: PathBuf) -> Result<()> {
        self.add_new_task_at(work_unit, scratch_dir, Utc::now())
    }

    /// Register a task and put it in `waiting`.
    ///
    /// # Panics
    ///
    /// Panics if a task with the same id is already registered.
    pub fn add_new_task_at(
        &mut self,
        mut work_unit: Box<dyn WorkUnit>,
        scratch_dir: PathBuf,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let task_id = work_unit.header().task_id.clone();
        assert!(
            !self.registry.contains(&task_id),
            "task {} is already registered",
            task_id
        );

        {
            let header = work_unit.header_mut();
            header.owner = TaskOwner {
                key_id: self.node.key_id.clone(),
                node_name: self.node.node_name.clone(),
                address: self.node.address.to_string(),
                port: self.node.port,
            };
            header.last_checking = now;
        }
        work_unit.initialize(&scratch_dir)?;

        let mut state = TaskState::new(now);
        state.transition(TaskStatus::Waiting);
        self.registry
            .insert(task_id.clone(), TaskEntry::new(work_unit, scratch_dir), state);

        tracing::info!(task_id = %task_id, "Task added");
        self.listeners
            .task_changed(&task_id, TaskStatus::Waiting, TaskOp::Created);
        Ok(())
    }

    // =========================================================================
    // Offers
    // =========================================================================

    pub fn get_next_subtask(&mut self, offer: &WorkOffer) -> Assignment {
        self.get_next_subtask_at(offer, Utc::now())
    }

    /// Hand out a subtask of `offer.task_id` to the offering node.
    ///
    /// Admission checks run first and a refused offer changes nothing. A
    /// restarted slot without a provider is re-issued under its old id before
    /// a fresh id is minted.
    pub fn get_next_subtask_at(&mut self, offer: &WorkOffer, now: DateTime<Utc>) -> Assignment {
        if let Err(rejection) = check_offer(&self.registry, offer, &self.node.key_id) {
            tracing::debug!(
                task_id = %offer.task_id,
                node_id = %offer.node_id,
                price = offer.price,
                reason = %rejection,
                "Offer refused"
            );
            return match rejection {
                Rejection::UnknownTask => Assignment::UnknownTask,
                _ => Assignment::NoWork,
            };
        }

        let reused = self
            .registry
            .state(&offer.task_id)
            .and_then(|s| s.free_slot())
            .map(str::to_string);
        let subtask_id = match reused {
            Some(id) => id,
            None => self.mint_subtask_id(),
        };

        let request = SubtaskRequest {
            subtask_id: subtask_id.clone(),
            performance: offer.performance,
            num_cores: offer.num_cores,
            node_id: offer.node_id.clone(),
            node_name: offer.node_name.clone(),
        };

        let Some((entry, state)) = self.registry.entry_mut(&offer.task_id) else {
            return Assignment::UnknownTask;
        };

        let payload = match entry.work_unit.produce_subtask(&request) {
            Production::Subtask(payload) => payload,
            Production::ShouldWait => {
                tracing::info!(
                    task_id = %offer.task_id,
                    node_id = %offer.node_id,
                    "Waiting for results from node"
                );
                return Assignment::ShouldWait;
            }
            Production::Rejected => {
                tracing::warn!(
                    task_id = %offer.task_id,
                    node_id = %offer.node_id,
                    "Node is banned from task"
                );
                return Assignment::ShouldWait;
            }
        };

        let header = entry.header();
        let timeout = header.subtask_timeout;
        let definition = SubtaskDefinition {
            task_id: offer.task_id.clone(),
            subtask_id: subtask_id.clone(),
            deadline: deadline_after(now, timeout),
            extra_data: payload.extra_data.clone(),
            short_description: payload.short_description,
            return_address: header.owner.address.clone(),
            return_port: header.owner.port,
            key_id: header.owner.key_id.clone(),
            environment: header.environment.clone(),
            performance: offer.performance,
        };

        let previous_status = state.status;
        if previous_status == TaskStatus::Waiting {
            state.transition(TaskStatus::Starting);
        }
        let task_status = state.status;

        let computer = ComputerInfo {
            node_id: offer.node_id.clone(),
            node_name: offer.node_name.clone(),
            performance: offer.performance,
            ip_address: offer.address.clone(),
            price: offer.price,
            num_cores: offer.num_cores,
        };
        let subtask =
            SubtaskState::assigned(subtask_id.clone(), computer, payload.extra_data, timeout, now);

        if !self.registry.bind_subtask(&offer.task_id, subtask) {
            if let Some(entry) = self.registry.task_mut(&offer.task_id) {
                entry.work_unit.restart_subtask(&subtask_id);
            }
            return Assignment::NoWork;
        }

        tracing::info!(
            task_id = %offer.task_id,
            subtask_id = %subtask_id,
            node_id = %offer.node_id,
            "Subtask assigned"
        );
        self.listeners.subtask_changed(
            &offer.task_id,
            &subtask_id,
            SubtaskStatus::Starting,
            SubtaskOp::Assigned,
        );
        if task_status != previous_status {
            self.listeners
                .task_changed(&offer.task_id, task_status, TaskOp::Updated);
        }
        Assignment::Subtask(definition)
    }

    /// Note that a node showed interest in a task. Unknown ids are ignored.
    pub fn record_work_offer(&mut self, task_id: &str) {
        let Some(state) = self.registry.state_mut(task_id) else {
            return;
        };
        let offers = state
            .extra_data
            .get(OFFERS_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        state
            .extra_data
            .insert(OFFERS_KEY.to_string(), Value::from(offers + 1));
        let status = state.status;
        self.listeners
            .task_changed(task_id, status, TaskOp::WorkOfferReceived);
    }

    fn mint_subtask_id(&self) -> String {
        loop {
            let id = Uuid::from_u128(OsRng.gen::<u128>()).to_string();
            if !self.registry.is_indexed(&id) {
                return id;
            }
        }
    }

    // =========================================================================
    // Results
    // =========================================================================

    pub fn report_success(&mut self, subtask_id: &str, result: TaskResult) -> Result<SubtaskStatus> {
        self.report_success_at(subtask_id, result, Utc::now())
    }

    /// Feed a provider's result to the work unit and verify it.
    ///
    /// Returns the subtask's new status (`finished` or `failure`). Reports for
    /// unknown ids or for subtasks that are not awaiting a result change
    /// nothing and come back as errors.
    pub fn report_success_at(
        &mut self,
        subtask_id: &str,
        result: TaskResult,
        now: DateTime<Utc>,
    ) -> Result<SubtaskStatus> {
        let task_id = self.owner_or_warn(subtask_id)?;
        let Some((entry, state)) = self.registry.entry_mut(&task_id) else {
            return Err(SchedulerError::UnknownTask(task_id));
        };
        let Some(ss) = state.subtask_states.get_mut(subtask_id) else {
            return Err(SchedulerError::UnknownSubtask(subtask_id.to_string()));
        };
        if !ss.status.awaits_result() {
            tracing::warn!(
                subtask_id,
                status = %ss.status,
                "Result for subtask with invalid status"
            );
            return Err(SchedulerError::NotAwaitingResult {
                subtask_id: subtask_id.to_string(),
                status: ss.status,
            });
        }

        entry
            .work_unit
            .absorb_result(subtask_id, result, &entry.scratch_dir);

        let elapsed = elapsed_secs(ss.time_started, now);
        ss.progress = 1.0;
        ss.remaining_time = 0.0;
        ss.elapsed_time = elapsed;
        ss.value = ss
            .computer
            .as_ref()
            .map(|c| price_for_work(c.price, elapsed))
            .unwrap_or(0);
        ss.stdout = entry.work_unit.stdout(subtask_id);
        ss.stderr = entry.work_unit.stderr(subtask_id);
        ss.results = entry.work_unit.results(subtask_id);

        let (subtask_status, subtask_op) = if entry.work_unit.verify_subtask(subtask_id) {
            (SubtaskStatus::Finished, SubtaskOp::Finished)
        } else {
            tracing::info!(subtask_id, "Subtask result not accepted");
            ss.stderr = "[taskmesh] Not accepted".to_string();
            (SubtaskStatus::Failure, SubtaskOp::NotAccepted)
        };
        ss.transition(subtask_status);

        let previous_status = state.status;
        let mut task_op = None;
        if state.status.is_active() {
            state.transition(TaskStatus::Computing);
            if entry.work_unit.finished_computation() {
                if entry.work_unit.verify_task() {
                    tracing::info!(task_id = %task_id, "Task finished");
                    state.transition(TaskStatus::Finished);
                    task_op = Some(TaskOp::Finished);
                } else {
                    tracing::warn!(task_id = %task_id, "Task finished but was not accepted");
                    task_op = Some(TaskOp::NotAccepted);
                }
            }
        }
        let task_status = state.status;

        self.listeners
            .subtask_changed(&task_id, subtask_id, subtask_status, subtask_op);
        match task_op {
            Some(op) => self.listeners.task_changed(&task_id, task_status, op),
            None if task_status != previous_status => {
                self.listeners
                    .task_changed(&task_id, task_status, TaskOp::Updated)
            }
            None => {}
        }
        Ok(subtask_status)
    }

    /// Record that a provider gave up on or broke a subtask.
    pub fn report_failure(&mut self, subtask_id: &str, error: &str) -> Result<()> {
        let task_id = self.owner_or_warn(subtask_id)?;
        let Some((entry, state)) = self.registry.entry_mut(&task_id) else {
            return Err(SchedulerError::UnknownTask(task_id));
        };
        let Some(ss) = state.subtask_states.get_mut(subtask_id) else {
            return Err(SchedulerError::UnknownSubtask(subtask_id.to_string()));
        };
        if !ss.status.awaits_result() {
            tracing::warn!(
                subtask_id,
                status = %ss.status,
                "Failure report for subtask with invalid status"
            );
            return Err(SchedulerError::NotAwaitingResult {
                subtask_id: subtask_id.to_string(),
                status: ss.status,
            });
        }

        entry.work_unit.computation_failed(subtask_id);
        ss.progress = 1.0;
        ss.stderr = error.to_string();
        ss.transition(SubtaskStatus::Failure);
        let task_status = state.status;

        tracing::info!(task_id = %task_id, subtask_id, error, "Subtask failed");
        self.listeners.subtask_changed(
            &task_id,
            subtask_id,
            SubtaskStatus::Failure,
            SubtaskOp::Failed,
        );
        self.listeners
            .task_changed(&task_id, task_status, TaskOp::Updated);
        Ok(())
    }

    fn owner_or_warn(&self, subtask_id: &str) -> Result<String> {
        match self.registry.owner_of(subtask_id) {
            Some(task_id) => Ok(task_id.to_string()),
            None => {
                tracing::warn!(subtask_id, "Unknown subtask");
                Err(SchedulerError::UnknownSubtask(subtask_id.to_string()))
            }
        }
    }

    // =========================================================================
    // Deadline sweep
    // =========================================================================

    pub fn check_timeouts(&mut self) -> SweepReport {
        self.check_timeouts_at(Utc::now())
    }

    /// Charge elapsed wall-clock time to every active task and its starting
    /// subtasks. Subtasks whose ttl runs out fail; tasks whose ttl runs out
    /// are dropped.
    pub fn check_timeouts_at(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for task_id in self.registry.task_ids() {
            let Some((entry, state)) = self.registry.entry_mut(&task_id) else {
                continue;
            };
            if !state.status.is_active() {
                continue;
            }

            let header = entry.work_unit.header_mut();
            let task_ttl = decay(&mut header.ttl, &mut header.last_checking, now);
            if task_ttl <= 0.0 {
                tracing::info!(task_id = %task_id, "Task dies");
                entry.work_unit.abort();
                state.transition(TaskStatus::Timeout);
                self.listeners
                    .task_changed(&task_id, TaskStatus::Timeout, TaskOp::Timeout);
                self.registry.remove(&task_id);
                report.expired_tasks.push(task_id);
                continue;
            }

            let mut timed_out = Vec::new();
            for ss in state.subtask_states.values_mut() {
                if ss.status != SubtaskStatus::Starting {
                    continue;
                }
                let remaining = decay(&mut ss.ttl, &mut ss.last_checking, now);
                ss.remaining_time = remaining.max(0.0);
                if remaining > 0.0 {
                    continue;
                }
                tracing::info!(subtask_id = %ss.subtask_id, "Subtask dies");
                ss.transition(SubtaskStatus::Failure);
                ss.stderr = "[taskmesh] Timeout".to_string();
                entry.work_unit.computation_failed(&ss.subtask_id);
                if let Some(node_id) = ss.node_id() {
                    report.penalized_nodes.push(node_id.to_string());
                }
                timed_out.push(ss.subtask_id.clone());
            }

            for subtask_id in &timed_out {
                self.listeners.subtask_changed(
                    &task_id,
                    subtask_id,
                    SubtaskStatus::Failure,
                    SubtaskOp::Timeout,
                );
            }
            report.timed_out_subtasks.extend(timed_out);
        }

        report
    }

    // =========================================================================
    // Operator controls
    // =========================================================================

    pub fn restart_task(&mut self, task_id: &str) -> Result<()> {
        self.restart_task_at(task_id, Utc::now())
    }

    /// Put the task back to `waiting` and free every subtask that has not
    /// failed for reassignment.
    pub fn restart_task_at(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<()> {
        let Some((entry, state)) = self.registry.entry_mut(task_id) else {
            tracing::warn!(task_id, "Cannot restart unknown task");
            return Err(SchedulerError::UnknownTask(task_id.to_string()));
        };
        if !state.status.can_transition_to(TaskStatus::Waiting) {
            return Err(SchedulerError::InvalidTransition {
                task_id: task_id.to_string(),
                from: state.status,
                to: TaskStatus::Waiting,
            });
        }

        entry.work_unit.restart();
        entry.work_unit.header_mut().last_checking = now;
        state.transition(TaskStatus::Waiting);
        state.progress = 0.0;
        state.remaining_time = None;
        state.time_started = now;

        let mut restarted = Vec::new();
        for ss in state.subtask_states.values_mut() {
            if ss.status == SubtaskStatus::Failure {
                continue;
            }
            if ss.transition(SubtaskStatus::Restarted) {
                ss.computer = None;
                restarted.push(ss.subtask_id.clone());
            }
        }

        tracing::info!(task_id, subtasks = restarted.len(), "Task restarted");
        for subtask_id in &restarted {
            self.listeners.subtask_changed(
                task_id,
                subtask_id,
                SubtaskStatus::Restarted,
                SubtaskOp::Restarted,
            );
        }
        self.listeners
            .task_changed(task_id, TaskStatus::Waiting, TaskOp::Restarted);
        Ok(())
    }

    /// Free a single subtask for reassignment on operator request.
    pub fn restart_subtask(&mut self, subtask_id: &str) -> Result<()> {
        self.reissue_subtask(subtask_id, SubtaskStatus::Restarted, SubtaskOp::Restarted)
    }

    /// Free every subtask a silent node is still computing. Returns the
    /// resent subtask ids.
    pub fn resend_node_subtasks(&mut self, node_id: &str) -> Vec<String> {
        let held: Vec<String> = self
            .registry
            .entries()
            .flat_map(|(_, _, state)| state.subtask_states.values())
            .filter(|ss| ss.status == SubtaskStatus::Starting && ss.node_id() == Some(node_id))
            .map(|ss| ss.subtask_id.clone())
            .collect();

        held.into_iter()
            .filter(|subtask_id| {
                self.reissue_subtask(subtask_id, SubtaskStatus::Resent, SubtaskOp::Resent)
                    .is_ok()
            })
            .collect()
    }

    fn reissue_subtask(
        &mut self,
        subtask_id: &str,
        new_status: SubtaskStatus,
        op: SubtaskOp,
    ) -> Result<()> {
        let task_id = self.owner_or_warn(subtask_id)?;
        let Some((entry, state)) = self.registry.entry_mut(&task_id) else {
            return Err(SchedulerError::UnknownTask(task_id));
        };
        let Some(ss) = state.subtask_states.get_mut(subtask_id) else {
            return Err(SchedulerError::UnknownSubtask(subtask_id.to_string()));
        };
        if !ss.status.can_transition_to(new_status) {
            return Err(SchedulerError::InvalidSubtaskTransition {
                subtask_id: subtask_id.to_string(),
                from: ss.status,
                to: new_status,
            });
        }

        entry.work_unit.restart_subtask(subtask_id);
        ss.transition(new_status);
        ss.computer = None;
        ss.stderr = format!("[taskmesh] {}", new_status);

        let previous_status = state.status;
        if state.status.is_active() || state.status == TaskStatus::Finished {
            state.transition(TaskStatus::Computing);
        }
        let task_status = state.status;

        tracing::info!(task_id = %task_id, subtask_id, status = %new_status, "Subtask reissued");
        self.listeners
            .subtask_changed(&task_id, subtask_id, new_status, op);
        if task_status != previous_status {
            self.listeners
                .task_changed(&task_id, task_status, TaskOp::Updated);
        }
        Ok(())
    }

    /// Stop a task for good. Its subtasks are forgotten.
    pub fn abort_task(&mut self, task_id: &str) -> Result<()> {
        let Some((entry, state)) = self.registry.entry_mut(task_id) else {
            tracing::warn!(task_id, "Cannot abort unknown task");
            return Err(SchedulerError::UnknownTask(task_id.to_string()));
        };
        if !state.status.can_transition_to(TaskStatus::Aborted) {
            return Err(SchedulerError::InvalidTransition {
                task_id: task_id.to_string(),
                from: state.status,
                to: TaskStatus::Aborted,
            });
        }

        entry.work_unit.abort();
        state.transition(TaskStatus::Aborted);
        let removed = self.registry.unbind_subtasks(task_id);

        tracing::info!(task_id, subtasks = removed.len(), "Task aborted");
        self.listeners
            .task_changed(task_id, TaskStatus::Aborted, TaskOp::Aborted);
        Ok(())
    }

    pub fn pause_task(&mut self, task_id: &str) -> Result<()> {
        self.move_task(task_id, TaskStatus::Paused, TaskOp::Paused, None)
    }

    pub fn resume_task(&mut self, task_id: &str) -> Result<()> {
        self.resume_task_at(task_id, Utc::now())
    }

    /// Move a paused task back to `starting`. Time spent paused is not charged
    /// to the task's or its subtasks' ttl.
    pub fn resume_task_at(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<()> {
        if self.registry.state(task_id).map(|s| s.status) != Some(TaskStatus::Paused) {
            let from = self.registry.state(task_id).map(|s| s.status);
            return match from {
                None => Err(SchedulerError::UnknownTask(task_id.to_string())),
                Some(from) => Err(SchedulerError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from,
                    to: TaskStatus::Starting,
                }),
            };
        }
        self.move_task(task_id, TaskStatus::Starting, TaskOp::Resumed, Some(now))
    }

    fn move_task(
        &mut self,
        task_id: &str,
        next: TaskStatus,
        op: TaskOp,
        reset_clocks_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let Some((entry, state)) = self.registry.entry_mut(task_id) else {
            tracing::warn!(task_id, "Unknown task");
            return Err(SchedulerError::UnknownTask(task_id.to_string()));
        };
        if state.status == next || !state.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                task_id: task_id.to_string(),
                from: state.status,
                to: next,
            });
        }

        state.transition(next);
        if let Some(now) = reset_clocks_at {
            entry.work_unit.header_mut().last_checking = now;
            for ss in state.subtask_states.values_mut() {
                if ss.status == SubtaskStatus::Starting {
                    ss.last_checking = now;
                }
            }
        }

        tracing::info!(task_id, status = %next, "Task status changed");
        self.listeners.task_changed(task_id, next, op);
        Ok(())
    }

    /// Forget a task entirely. Returns the scratch directory it used.
    pub fn delete_task(&mut self, task_id: &str) -> Result<PathBuf> {
        let Some((entry, state)) = self.registry.remove(task_id) else {
            tracing::warn!(task_id, "Cannot delete unknown task");
            return Err(SchedulerError::UnknownTask(task_id.to_string()));
        };

        tracing::info!(task_id, subtasks = state.subtask_states.len(), "Task deleted");
        self.listeners
            .task_changed(task_id, state.status, TaskOp::Deleted);
        Ok(entry.scratch_dir)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn query_task_state(&self, task_id: &str) -> Result<TaskState> {
        self.query_task_state_at(task_id, Utc::now())
    }

    /// Snapshot of a task's state with progress and time estimates filled in.
    pub fn query_task_state_at(&self, task_id: &str, now: DateTime<Utc>) -> Result<TaskState> {
        let (entry, state) = self
            .registry
            .entry(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;

        let mut snapshot = state.clone();
        snapshot.progress = entry.work_unit.progress();
        snapshot.elapsed_time = elapsed_secs(state.time_started, now);
        snapshot.remaining_time = if snapshot.progress > 0.0 {
            Some(snapshot.elapsed_time / snapshot.progress - snapshot.elapsed_time)
        } else {
            None
        };
        Ok(snapshot)
    }

    /// Headers of tasks that currently accept offers.
    pub fn active_task_headers(&self) -> Vec<TaskHeader> {
        self.registry
            .entries()
            .filter(|(_, entry, state)| {
                state.status.is_active() && entry.work_unit.needs_computation()
            })
            .map(|(_, entry, _)| entry.header().clone())
            .collect()
    }

    pub fn progresses(&self) -> Vec<TaskProgress> {
        self.registry
            .entries()
            .filter(|(_, _, state)| !state.status.is_completed())
            .map(|(task_id, entry, state)| TaskProgress {
                task_id: task_id.clone(),
                status: state.status,
                total_subtasks: entry.work_unit.total_subtasks(),
                active_subtasks: entry.work_unit.active_subtasks(),
                progress: entry.work_unit.progress(),
            })
            .collect()
    }

    /// Task that owns `subtask_id`
    pub fn subtask_owner(&self, subtask_id: &str) -> Option<&str> {
        self.registry.owner_of(subtask_id)
    }

    pub fn subtask_state(&self, subtask_id: &str) -> Option<&SubtaskState> {
        let task_id = self.registry.owner_of(subtask_id)?;
        self.registry.state(task_id)?.subtask_states.get(subtask_id)
    }

    /// Node currently holding `subtask_id`
    pub fn node_for_subtask(&self, subtask_id: &str) -> Option<&str> {
        self.subtask_state(subtask_id)?.node_id()
    }

    pub fn subtasks(&self, task_id: &str) -> Option<Vec<String>> {
        self.registry
            .state(task_id)
            .map(|s| s.subtask_states.keys().cloned().collect())
    }

    pub fn verify_subtask(&self, subtask_id: &str) -> bool {
        self.registry
            .owner_of(subtask_id)
            .and_then(|task_id| self.registry.task(task_id))
            .is_some_and(|entry| entry.work_unit.verify_subtask(subtask_id))
    }

    pub fn task_resources(&self, task_id: &str) -> Result<Vec<PathBuf>> {
        self.registry
            .task(task_id)
            .map(|entry| entry.work_unit.resources())
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))
    }

    /// Attach a hint to the task's extra data.
    pub fn set_task_extra(&mut self, task_id: &str, key: &str, value: Value) -> Result<()> {
        let state = self
            .registry
            .state_mut(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;
        state.extra_data.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_for_work_rounds_up() {
        assert_eq!(price_for_work(10, 1.0), 10);
        assert_eq!(price_for_work(10, 1.01), 11);
        assert_eq!(price_for_work(3, 0.5), 2);
        assert_eq!(price_for_work(0, 100.0), 0);
        assert_eq!(price_for_work(7, 0.0), 0);
    }

    #[test]
    fn price_for_work_ignores_negative_time() {
        assert_eq!(price_for_work(10, -5.0), 0);
    }

    #[test]
    fn price_for_work_is_exact_for_large_prices() {
        let price = (1u64 << 53) + 1;
        assert_eq!(price_for_work(price, 1.0), price);
        assert_eq!(price_for_work(price, 3.0), price * 3);
        assert_eq!(price_for_work(u64::MAX, 2.0), u64::MAX);
        assert_eq!(price_for_work(5, f64::INFINITY), u64::MAX);
        assert_eq!(price_for_work(0, f64::INFINITY), 0);
    }

    #[test]
    fn assignment_accessors() {
        assert!(Assignment::UnknownTask.is_unknown_task());
        assert!(!Assignment::NoWork.is_unknown_task());
        assert!(Assignment::ShouldWait.subtask().is_none());
        assert!(Assignment::NoWork.into_subtask().is_none());
    }
}
