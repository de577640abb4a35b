//! Task-type specific producers of subtasks.
//!
//! The scheduler is generic over [`WorkUnit`]: it routes offers, results and
//! failures to the work unit and never looks inside a subtask payload.
//!
//! # Components
//!
//! - [`WorkUnit`]: the capability set every task type implements
//! - [`ChunkedWorkUnit`]: splits an index range into fixed-size chunks

pub mod chunked;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::scheduler::TaskHeader;

pub use chunked::ChunkedWorkUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Data,
    Files,
}

/// Result delivered by a provider for one subtask.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Data(Vec<u8>),
    Files(Vec<PathBuf>),
}

impl TaskResult {
    pub fn kind(&self) -> ResultKind {
        match self {
            TaskResult::Data(_) => ResultKind::Data,
            TaskResult::Files(_) => ResultKind::Files,
        }
    }
}

/// What the scheduler knows about the offer when it asks for a subtask.
#[derive(Debug, Clone)]
pub struct SubtaskRequest {
    /// Id the produced subtask will be registered under
    pub subtask_id: String,
    pub performance: f64,
    pub num_cores: u32,
    pub node_id: String,
    pub node_name: String,
}

/// Task-type specific part of a subtask definition.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskPayload {
    pub extra_data: Value,
    pub short_description: String,
}

/// Answer of a work unit to a request for a subtask.
#[derive(Debug, Clone, PartialEq)]
pub enum Production {
    Subtask(SubtaskPayload),
    /// The node still holds unfinished work from this task
    ShouldWait,
    /// The node is banned from this task
    Rejected,
}

/// Everything a provider needs to compute a subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskDefinition {
    pub task_id: String,
    pub subtask_id: String,
    pub deadline: DateTime<Utc>,
    pub extra_data: Value,
    pub short_description: String,
    pub return_address: String,
    pub return_port: u16,
    pub key_id: String,
    pub environment: String,
    pub performance: f64,
}

pub trait WorkUnit: Send + Sync {
    fn header(&self) -> &TaskHeader;

    fn header_mut(&mut self) -> &mut TaskHeader;

    /// Called once at registration, after the scratch directory exists.
    fn initialize(&mut self, scratch_dir: &Path) -> Result<()>;

    /// Some unit of work has not been handed out yet.
    fn needs_computation(&self) -> bool;

    /// Every unit of work has a result.
    fn finished_computation(&self) -> bool;

    fn produce_subtask(&mut self, request: &SubtaskRequest) -> Production;

    fn absorb_result(&mut self, subtask_id: &str, result: TaskResult, result_dir: &Path);

    fn computation_failed(&mut self, subtask_id: &str);

    fn verify_subtask(&self, subtask_id: &str) -> bool;

    fn verify_task(&self) -> bool;

    /// Fraction of the task that is done, in `0.0..=1.0`.
    fn progress(&self) -> f64;

    fn restart(&mut self);

    fn restart_subtask(&mut self, subtask_id: &str);

    fn abort(&mut self);

    fn total_subtasks(&self) -> usize {
        0
    }

    fn active_subtasks(&self) -> usize {
        0
    }

    fn subtasks_left(&self) -> usize {
        0
    }

    fn stdout(&self, _subtask_id: &str) -> String {
        String::new()
    }

    fn stderr(&self, _subtask_id: &str) -> String {
        String::new()
    }

    fn results(&self, _subtask_id: &str) -> Vec<String> {
        Vec::new()
    }

    /// Files providers have to download before computing.
    fn resources(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}
