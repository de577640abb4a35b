use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::listener::EventListener;
use crate::resource::{DirectoryManager, ResourceDistributor};
use crate::scheduler::{
    Assignment, SubtaskStatus, SweepReport, TaskHeader, TaskManager, TaskProgress, TaskState,
    WorkOffer,
};
use crate::work_unit::{TaskResult, WorkUnit};

const RESOURCE_HASH_KEY: &str = "resource_hash";

/// Requester side of the scheduler.
///
/// Wraps a [`TaskManager`] in a single lock and performs scratch directory and
/// resource I/O outside of it. Cloning is cheap; clones share the same tasks.
#[derive(Clone)]
pub struct RequesterNode {
    config: SchedulerConfig,
    manager: Arc<RwLock<TaskManager>>,
    dir_manager: Arc<dyn DirectoryManager>,
    distributor: Option<Arc<dyn ResourceDistributor>>,
    penalties: Option<mpsc::Sender<String>>,
}

impl RequesterNode {
    pub fn new(config: SchedulerConfig, dir_manager: Arc<dyn DirectoryManager>) -> Self {
        let manager = TaskManager::new(config.node.clone());
        Self {
            config,
            manager: Arc::new(RwLock::new(manager)),
            dir_manager,
            distributor: None,
            penalties: None,
        }
    }

    pub fn with_distributor(mut self, distributor: Arc<dyn ResourceDistributor>) -> Self {
        self.distributor = Some(distributor);
        self
    }

    /// Node ids whose subtasks time out are sent here.
    pub fn with_penalty_sink(mut self, penalties: mpsc::Sender<String>) -> Self {
        self.penalties = Some(penalties);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn manager(&self) -> Arc<RwLock<TaskManager>> {
        self.manager.clone()
    }

    pub async fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.manager.write().await.add_listener(listener);
    }

    /// Prepare an empty scratch directory for the task and register it.
    ///
    /// # Panics
    ///
    /// If a task with the same id is already registered. The check happens
    /// before the scratch directory is touched, so the live task keeps its files.
    pub async fn register(&self, work_unit: Box<dyn WorkUnit>) -> Result<()> {
        let task_id = work_unit.header().task_id.clone();
        assert!(
            !self.manager.read().await.contains_task(&task_id),
            "task {} is already registered",
            task_id
        );
        let scratch_dir = self.dir_manager.get_or_create_scratch_dir(&task_id)?;
        self.dir_manager.clear_scratch(&task_id, true)?;
        self.manager
            .write()
            .await
            .add_new_task(work_unit, scratch_dir)
    }

    pub async fn request_work(&self, offer: &WorkOffer) -> Assignment {
        let mut manager = self.manager.write().await;
        manager.record_work_offer(&offer.task_id);
        manager.get_next_subtask(offer)
    }

    pub async fn report_success(&self, subtask_id: &str, result: TaskResult) -> Result<SubtaskStatus> {
        self.manager.write().await.report_success(subtask_id, result)
    }

    pub async fn report_failure(&self, subtask_id: &str, error: &str) -> Result<()> {
        self.manager.write().await.report_failure(subtask_id, error)
    }

    /// Restart a task and wipe its scratch directory, keeping undeletable
    /// entries.
    pub async fn restart_task(&self, task_id: &str) -> Result<()> {
        self.manager.write().await.restart_task(task_id)?;
        if let Err(e) = self.dir_manager.clear_scratch(task_id, true) {
            tracing::warn!(task_id, error = %e, "Failed to clear scratch directory");
        }
        Ok(())
    }

    pub async fn restart_subtask(&self, subtask_id: &str) -> Result<()> {
        self.manager.write().await.restart_subtask(subtask_id)
    }

    /// Reissue everything a silent node was computing.
    pub async fn resend_node_subtasks(&self, node_id: &str) -> Vec<String> {
        self.manager.write().await.resend_node_subtasks(node_id)
    }

    pub async fn abort_task(&self, task_id: &str) -> Result<()> {
        self.manager.write().await.abort_task(task_id)
    }

    pub async fn pause_task(&self, task_id: &str) -> Result<()> {
        self.manager.write().await.pause_task(task_id)
    }

    pub async fn resume_task(&self, task_id: &str) -> Result<()> {
        self.manager.write().await.resume_task(task_id)
    }

    /// Forget a task, then remove its scratch files and published resources.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        self.manager.write().await.delete_task(task_id)?;

        if let Err(e) = self.dir_manager.clear_scratch(task_id, false) {
            tracing::warn!(task_id, error = %e, "Failed to clear scratch directory");
        }
        if let Some(distributor) = &self.distributor {
            if let Err(e) = distributor.remove_resources(task_id) {
                tracing::warn!(task_id, error = %e, "Failed to remove task resources");
            }
        }
        Ok(())
    }

    /// Publish the task's resources and remember their hash on the task.
    pub async fn share_resources(&self, task_id: &str) -> Result<String> {
        let distributor = self
            .distributor
            .clone()
            .ok_or_else(|| SchedulerError::Distribution("no distributor configured".into()))?;
        let files = self.manager.read().await.task_resources(task_id)?;

        let hash = distributor.push_resources(task_id, &files)?;
        tracing::info!(task_id, hash = %hash, files = files.len(), "Resources shared");

        self.manager.write().await.set_task_extra(
            task_id,
            RESOURCE_HASH_KEY,
            serde_json::Value::String(hash.clone()),
        )?;
        Ok(hash)
    }

    pub async fn query_task_state(&self, task_id: &str) -> Result<TaskState> {
        self.manager.read().await.query_task_state(task_id)
    }

    pub async fn active_task_headers(&self) -> Vec<TaskHeader> {
        self.manager.read().await.active_task_headers()
    }

    pub async fn subtask_owner(&self, subtask_id: &str) -> Option<String> {
        self.manager
            .read()
            .await
            .subtask_owner(subtask_id)
            .map(str::to_string)
    }

    pub async fn progresses(&self) -> Vec<TaskProgress> {
        self.manager.read().await.progresses()
    }

    /// Run one deadline sweep and act on its outcome.
    pub async fn sweep_once(&self) -> SweepReport {
        let report = self.manager.write().await.check_timeouts();

        for node_id in &report.penalized_nodes {
            tracing::info!(node_id = %node_id, "Penalizing node for timed out subtask");
            if let Some(penalties) = &self.penalties {
                if let Err(e) = penalties.try_send(node_id.clone()) {
                    tracing::warn!(node_id = %node_id, error = %e, "Dropped node penalty");
                }
            }
        }
        for task_id in &report.expired_tasks {
            if let Err(e) = self.dir_manager.clear_scratch(task_id, false) {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to clear scratch directory");
            }
        }

        report
    }

    /// Sweep deadlines on the configured interval until `shutdown` fires.
    pub async fn run_sweeper(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep_once().await;
                    if !report.is_empty() {
                        tracing::debug!(
                            timed_out = report.timed_out_subtasks.len(),
                            expired = report.expired_tasks.len(),
                            "Sweep finished"
                        );
                    }
                }
            }
        }
    }
}
