
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use taskmesh::config::SchedulerConfig;
use taskmesh::error::SchedulerError;
use taskmesh::node::RequesterNode;
use taskmesh::resource::LocalDirManager;
use taskmesh::scheduler::{SubtaskStatus, TaskHeader, TaskStatus, WorkOffer};
use taskmesh::work_unit::{ChunkedWorkUnit, TaskResult};
use test_harness::{assert_eventually, node_identity, MemoryDistributor, RecordingListener};

fn node_in(root: &std::path::Path) -> (RequesterNode, Arc<LocalDirManager>) {
    let config = SchedulerConfig::new(node_identity(), root.to_path_buf())
        .with_sweep_interval_ms(10);
    let dirs = Arc::new(LocalDirManager::new(root).with_undeletable(["resources"]));
    (RequesterNode::new(config, dirs.clone()), dirs)
}

fn chunked(task_id: &str, items: u64, ttl: f64, subtask_timeout: f64) -> Box<ChunkedWorkUnit> {
    let header = TaskHeader::new(task_id, ttl, subtask_timeout).with_max_price(100);
    Box::new(ChunkedWorkUnit::new(header, items, 1))
}

fn offer(node_id: &str, task_id: &str) -> WorkOffer {
    WorkOffer::new(node_id, task_id, 10).with_node(format!("{}-name", node_id), "10.0.0.9")
}

#[tokio::test]
async fn test_register_prepares_clean_scratch_dir() {
    let root = tempfile::tempdir().unwrap();
    let (node, dirs) = node_in(root.path());
    let scratch = dirs.scratch_dir("T");
    fs::create_dir_all(scratch.join("resources")).unwrap();
    fs::write(scratch.join("stale.bin"), b"old").unwrap();

    node.register(chunked("T", 4, 3600.0, 60.0)).await.unwrap();

    assert!(scratch.is_dir());
    assert!(!scratch.join("stale.bin").exists());
    assert!(scratch.join("resources").exists());
    assert_eq!(node.active_task_headers().await.len(), 1);
}

#[tokio::test]
async fn test_duplicate_register_keeps_live_scratch() {
    let root = tempfile::tempdir().unwrap();
    let (node, dirs) = node_in(root.path());
    node.register(chunked("T", 4, 3600.0, 60.0)).await.unwrap();
    let scratch = dirs.scratch_dir("T");
    fs::write(scratch.join("partial.bin"), b"x").unwrap();

    let again = node.clone();
    let outcome = tokio::spawn(async move {
        again.register(chunked("T", 4, 3600.0, 60.0)).await
    })
    .await;

    let err = outcome.expect_err("duplicate registration should panic");
    assert!(err.is_panic());
    assert!(scratch.join("partial.bin").exists());
    assert_eq!(node.active_task_headers().await.len(), 1);
}

#[tokio::test]
async fn test_request_work_and_report_results() {
    let root = tempfile::tempdir().unwrap();
    let (node, _) = node_in(root.path());
    let listener = Arc::new(RecordingListener::default());
    node.add_listener(listener.clone()).await;
    node.register(chunked("T", 2, 3600.0, 60.0)).await.unwrap();

    let first = node.request_work(&offer("A", "T")).await.into_subtask().unwrap();
    let second = node.request_work(&offer("B", "T")).await.into_subtask().unwrap();
    assert_ne!(first.subtask_id, second.subtask_id);
    assert_eq!(first.extra_data["chunk"], 0);
    assert_eq!(node.subtask_owner(&first.subtask_id).await.as_deref(), Some("T"));

    let status = node
        .report_success(&first.subtask_id, TaskResult::Data(vec![1]))
        .await
        .unwrap();
    assert_eq!(status, SubtaskStatus::Finished);
    node.report_failure(&second.subtask_id, "gpu lost").await.unwrap();

    let state = node.query_task_state("T").await.unwrap();
    assert_eq!(state.status, TaskStatus::Computing);
    assert_eq!(state.progress, 0.5);
    assert_eq!(state.extra_data["offers_received"], 2);

    // the failed chunk goes to another node, the failing one is banned
    assert!(node.request_work(&offer("B", "T")).await.subtask().is_none());
    let retry = node.request_work(&offer("C", "T")).await.into_subtask().unwrap();
    assert_eq!(retry.extra_data["chunk"], 1);
    node.report_success(&retry.subtask_id, TaskResult::Data(vec![2]))
        .await
        .unwrap();

    assert_eq!(
        node.query_task_state("T").await.unwrap().status,
        TaskStatus::Finished
    );
    assert!(!listener.events().is_empty());
}

#[tokio::test]
async fn test_restart_clears_scratch_but_keeps_undeletable() {
    let root = tempfile::tempdir().unwrap();
    let (node, dirs) = node_in(root.path());
    node.register(chunked("T", 2, 3600.0, 60.0)).await.unwrap();
    let scratch = dirs.scratch_dir("T");
    fs::create_dir_all(scratch.join("resources")).unwrap();
    fs::write(scratch.join("partial.bin"), b"x").unwrap();

    let sub = node.request_work(&offer("A", "T")).await.into_subtask().unwrap();
    node.restart_task("T").await.unwrap();

    assert!(!scratch.join("partial.bin").exists());
    assert!(scratch.join("resources").exists());
    assert_eq!(
        node.query_task_state("T").await.unwrap().status,
        TaskStatus::Waiting
    );

    let again = node.request_work(&offer("B", "T")).await.into_subtask().unwrap();
    assert_eq!(again.subtask_id, sub.subtask_id);
}

#[tokio::test]
async fn test_delete_removes_scratch_and_resources() {
    let root = tempfile::tempdir().unwrap();
    let (node, dirs) = node_in(root.path());
    let distributor = Arc::new(MemoryDistributor::default());
    let node = node.with_distributor(distributor.clone());
    node.register(chunked("T", 2, 3600.0, 60.0)).await.unwrap();
    let scratch = dirs.scratch_dir("T");
    fs::write(scratch.join("out.bin"), b"x").unwrap();

    node.delete_task("T").await.unwrap();

    assert!(!scratch.join("out.bin").exists());
    assert_eq!(*distributor.removed.lock().unwrap(), vec!["T".to_string()]);
    assert!(node.query_task_state("T").await.unwrap_err().is_not_found());
    assert!(node.delete_task("T").await.is_err());
}

#[tokio::test]
async fn test_share_resources_records_hash() {
    let root = tempfile::tempdir().unwrap();
    let (node, _) = node_in(root.path());
    let distributor = Arc::new(MemoryDistributor::default());
    let node = node.with_distributor(distributor.clone());

    let files = vec![PathBuf::from("scene.blend"), PathBuf::from("tex.png")];
    let header = TaskHeader::new("T", 3600.0, 60.0).with_max_price(100);
    let unit = ChunkedWorkUnit::new(header, 2, 1).with_resources(files.clone());
    node.register(Box::new(unit)).await.unwrap();

    let hash = node.share_resources("T").await.unwrap();

    assert_eq!(hash, "hash-T-2");
    assert_eq!(distributor.pushed.lock().unwrap()["T"], files);
    let state = node.query_task_state("T").await.unwrap();
    assert_eq!(state.extra_data["resource_hash"], "hash-T-2");

    assert!(node.share_resources("missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_share_resources_needs_distributor() {
    let root = tempfile::tempdir().unwrap();
    let (node, _) = node_in(root.path());
    node.register(chunked("T", 1, 3600.0, 60.0)).await.unwrap();

    assert!(matches!(
        node.share_resources("T").await,
        Err(SchedulerError::Distribution(_))
    ));
}

#[tokio::test]
async fn test_sweep_penalizes_silent_node() {
    let root = tempfile::tempdir().unwrap();
    let (node, _) = node_in(root.path());
    let (tx, mut rx) = mpsc::channel(8);
    let node = node.with_penalty_sink(tx);
    node.register(chunked("T", 2, 3600.0, 0.02)).await.unwrap();
    let sub = node.request_work(&offer("A", "T")).await.into_subtask().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = node.sweep_once().await;

    assert_eq!(report.timed_out_subtasks, vec![sub.subtask_id.clone()]);
    assert_eq!(rx.recv().await.as_deref(), Some("A"));
    assert!(node.report_success(&sub.subtask_id, TaskResult::Data(vec![1])).await.is_err());
}

#[tokio::test]
async fn test_sweep_drops_expired_task_and_its_scratch() {
    let root = tempfile::tempdir().unwrap();
    let (node, dirs) = node_in(root.path());
    node.register(chunked("T", 2, 0.02, 60.0)).await.unwrap();
    node.request_work(&offer("A", "T")).await.into_subtask().unwrap();
    let scratch = dirs.scratch_dir("T");
    fs::write(scratch.join("partial.bin"), b"x").unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = node.sweep_once().await;

    assert_eq!(report.expired_tasks, vec!["T".to_string()]);
    assert!(!scratch.join("partial.bin").exists());
    assert!(node.active_task_headers().await.is_empty());
}

#[tokio::test]
async fn test_background_sweeper_stops_on_shutdown() {
    let root = tempfile::tempdir().unwrap();
    let (node, _) = node_in(root.path());
    node.register(chunked("T", 2, 3600.0, 0.05)).await.unwrap();
    let sub = node.request_work(&offer("A", "T")).await.into_subtask().unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.clone().run_sweeper(shutdown.clone()));

    let manager = node.manager();
    let subtask_id = sub.subtask_id.clone();
    assert_eventually(
        || {
            let manager = manager.clone();
            let subtask_id = subtask_id.clone();
            async move {
                manager
                    .read()
                    .await
                    .subtask_state(&subtask_id)
                    .is_some_and(|s| s.status == SubtaskStatus::Failure)
            }
        },
        Duration::from_secs(2),
        "sweeper should time out the silent subtask",
    )
    .await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("sweeper should stop")
        .unwrap();
}

#[tokio::test]
async fn test_resend_and_controls_through_node() {
    let root = tempfile::tempdir().unwrap();
    let (node, _) = node_in(root.path());
    node.register(chunked("T", 3, 3600.0, 60.0)).await.unwrap();
    let sub = node.request_work(&offer("A", "T")).await.into_subtask().unwrap();

    assert_eq!(node.resend_node_subtasks("A").await, vec![sub.subtask_id.clone()]);
    node.restart_subtask(&sub.subtask_id).await.unwrap();

    node.pause_task("T").await.unwrap();
    assert!(node.progresses().await[0].status == TaskStatus::Paused);
    node.resume_task("T").await.unwrap();
    node.abort_task("T").await.unwrap();
    assert_eq!(
        node.query_task_state("T").await.unwrap().status,
        TaskStatus::Aborted
    );
    assert!(node.subtask_owner(&sub.subtask_id).await.is_none());
}
