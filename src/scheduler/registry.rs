use std::collections::HashMap;
use std::path::PathBuf;

use crate::scheduler::job::{SubtaskState, TaskHeader, TaskState};
use crate::work_unit::WorkUnit;

/// A registered task: its work unit and where it keeps scratch files.
pub struct TaskEntry {
    pub work_unit: Box<dyn WorkUnit>,
    pub scratch_dir: PathBuf,
}

impl TaskEntry {
    pub fn new(work_unit: Box<dyn WorkUnit>, scratch_dir: PathBuf) -> Self {
        Self {
            work_unit,
            scratch_dir,
        }
    }

    pub fn header(&self) -> &TaskHeader {
        self.work_unit.header()
    }
}

/// Task table, per-task state table and the flat subtask -> task index.
///
/// Every subtask id in the index is present in the subtask map of the task it
/// points to, and every subtask in a task's map is indexed to that task.
/// Mutations that touch subtasks go through this type to keep that true.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskEntry>,
    states: HashMap<String, TaskState>,
    subtask_index: HashMap<String, String>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Returns false if the id is already taken.
    pub fn insert(&mut self, task_id: String, entry: TaskEntry, state: TaskState) -> bool {
        if self.tasks.contains_key(&task_id) {
            return false;
        }
        self.states.insert(task_id.clone(), state);
        self.tasks.insert(task_id, entry);
        true
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskEntry> {
        self.tasks.get(task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskEntry> {
        self.tasks.get_mut(task_id)
    }

    pub fn state(&self, task_id: &str) -> Option<&TaskState> {
        self.states.get(task_id)
    }

    pub fn state_mut(&mut self, task_id: &str) -> Option<&mut TaskState> {
        self.states.get_mut(task_id)
    }

    pub fn entry(&self, task_id: &str) -> Option<(&TaskEntry, &TaskState)> {
        Some((self.tasks.get(task_id)?, self.states.get(task_id)?))
    }

    pub fn entry_mut(&mut self, task_id: &str) -> Option<(&mut TaskEntry, &mut TaskState)> {
        match (self.tasks.get_mut(task_id), self.states.get_mut(task_id)) {
            (Some(task), Some(state)) => Some((task, state)),
            _ => None,
        }
    }

    /// Task that owns `subtask_id`
    pub fn owner_of(&self, subtask_id: &str) -> Option<&str> {
        self.subtask_index.get(subtask_id).map(String::as_str)
    }

    pub fn is_indexed(&self, subtask_id: &str) -> bool {
        self.subtask_index.contains_key(subtask_id)
    }

    /// Record a subtask under its task, replacing an earlier state with the
    /// same id. Returns false if the task is unknown or the id belongs to
    /// another task.
    pub fn bind_subtask(&mut self, task_id: &str, subtask: SubtaskState) -> bool {
        if let Some(owner) = self.subtask_index.get(&subtask.subtask_id) {
            if owner != task_id {
                tracing::error!(
                    subtask_id = %subtask.subtask_id,
                    owner = %owner,
                    task_id,
                    "Subtask id already bound to another task"
                );
                return false;
            }
        }
        let Some(state) = self.states.get_mut(task_id) else {
            return false;
        };
        self.subtask_index
            .insert(subtask.subtask_id.clone(), task_id.to_string());
        state
            .subtask_states
            .insert(subtask.subtask_id.clone(), subtask);
        true
    }

    /// Drop every subtask of a task from both the index and the task's map.
    /// Returns the removed subtask ids.
    pub fn unbind_subtasks(&mut self, task_id: &str) -> Vec<String> {
        let Some(state) = self.states.get_mut(task_id) else {
            return Vec::new();
        };
        let removed: Vec<String> = state.subtask_states.drain().map(|(id, _)| id).collect();
        for subtask_id in &removed {
            self.subtask_index.remove(subtask_id);
        }
        removed
    }

    /// Remove a task together with all of its index entries.
    pub fn remove(&mut self, task_id: &str) -> Option<(TaskEntry, TaskState)> {
        if !self.tasks.contains_key(task_id) {
            return None;
        }
        let subtask_ids: Vec<String> = self
            .states
            .get(task_id)
            .map(|s| s.subtask_states.keys().cloned().collect())
            .unwrap_or_default();
        for subtask_id in &subtask_ids {
            self.subtask_index.remove(subtask_id);
        }
        let entry = self.tasks.remove(task_id)?;
        let state = self.states.remove(task_id)?;
        Some((entry, state))
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TaskEntry, &TaskState)> {
        self.tasks
            .iter()
            .filter_map(|(id, entry)| self.states.get(id).map(|state| (id, entry, state)))
    }

    pub fn subtask_count(&self) -> usize {
        self.subtask_index.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The index and the per-task subtask maps describe the same set.
    pub fn is_consistent(&self) -> bool {
        let index_ok = self.subtask_index.iter().all(|(subtask_id, task_id)| {
            self.states
                .get(task_id)
                .is_some_and(|s| s.subtask_states.contains_key(subtask_id))
        });
        let maps_ok = self.states.iter().all(|(task_id, state)| {
            state
                .subtask_states
                .keys()
                .all(|id| self.subtask_index.get(id) == Some(task_id))
        });
        let tables_ok = self.tasks.len() == self.states.len()
            && self.tasks.keys().all(|id| self.states.contains_key(id));
        index_ok && maps_ok && tables_ok
    }
}
