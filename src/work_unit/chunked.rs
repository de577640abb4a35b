use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::error::{Result, SchedulerError};
use crate::scheduler::TaskHeader;
use crate::work_unit::{Production, SubtaskPayload, SubtaskRequest, TaskResult, WorkUnit};

#[derive(Debug, Clone)]
struct ChunkResult {
    handles: Vec<String>,
    bytes: usize,
}

/// Work unit that splits `0..total_items` into chunks of `chunk_size` items.
///
/// A node may hold at most `max_per_node` unfinished chunks; a node that fails
/// a chunk is banned from the task.
#[derive(Debug)]
pub struct ChunkedWorkUnit {
    header: TaskHeader,
    total_items: u64,
    chunk_size: u64,
    max_per_node: usize,
    scratch_dir: Option<PathBuf>,
    resources: Vec<PathBuf>,
    pending: VecDeque<usize>,
    chunk_of: HashMap<String, usize>,
    node_of: HashMap<String, String>,
    completed: HashMap<usize, ChunkResult>,
    banned: HashSet<String>,
    aborted: bool,
}

impl ChunkedWorkUnit {
    pub fn new(header: TaskHeader, total_items: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut unit = Self {
            header,
            total_items,
            chunk_size,
            max_per_node: 1,
            scratch_dir: None,
            resources: Vec::new(),
            pending: VecDeque::new(),
            chunk_of: HashMap::new(),
            node_of: HashMap::new(),
            completed: HashMap::new(),
            banned: HashSet::new(),
            aborted: false,
        };
        unit.reset();
        unit
    }

    pub fn with_max_per_node(mut self, max_per_node: usize) -> Self {
        self.max_per_node = max_per_node.max(1);
        self
    }

    pub fn with_resources(mut self, resources: Vec<PathBuf>) -> Self {
        self.resources = resources;
        self
    }

    pub fn chunk_count(&self) -> usize {
        self.total_items.div_ceil(self.chunk_size) as usize
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch_dir.as_deref()
    }

    fn bounds(&self, chunk: usize) -> (u64, u64) {
        let start = chunk as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_items);
        (start, end)
    }

    fn reset(&mut self) {
        self.pending = (0..self.chunk_count()).collect();
        self.chunk_of.clear();
        self.node_of.clear();
        self.completed.clear();
        self.banned.clear();
        self.aborted = false;
    }

    fn unfinished_for_node(&self, node_id: &str) -> usize {
        self.node_of
            .iter()
            .filter(|(subtask_id, node)| {
                node.as_str() == node_id
                    && self
                        .chunk_of
                        .get(*subtask_id)
                        .is_some_and(|c| !self.completed.contains_key(c) && !self.pending.contains(c))
            })
            .count()
    }

    fn requeue(&mut self, subtask_id: &str) {
        if let Some(&chunk) = self.chunk_of.get(subtask_id) {
            if !self.completed.contains_key(&chunk) && !self.pending.contains(&chunk) {
                self.pending.push_front(chunk);
            }
        }
    }

    /// Chunk to hand out for `subtask_id`. A re-issued id keeps its old chunk
    /// when that chunk is still pending.
    fn take_chunk(&mut self, subtask_id: &str) -> Option<usize> {
        if let Some(&chunk) = self.chunk_of.get(subtask_id) {
            if let Some(pos) = self.pending.iter().position(|&c| c == chunk) {
                return self.pending.remove(pos);
            }
        }
        let chunk = self.pending.pop_front()?;
        // the chunk moves to a new id; results for older ids are stale
        self.chunk_of.retain(|_, c| *c != chunk);
        Some(chunk)
    }
}

impl WorkUnit for ChunkedWorkUnit {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut TaskHeader {
        &mut self.header
    }

    fn initialize(&mut self, scratch_dir: &Path) -> Result<()> {
        if !scratch_dir.is_dir() {
            return Err(SchedulerError::WorkUnit(format!(
                "scratch directory {} does not exist",
                scratch_dir.display()
            )));
        }
        self.scratch_dir = Some(scratch_dir.to_path_buf());
        self.reset();
        Ok(())
    }

    fn needs_computation(&self) -> bool {
        !self.aborted && !self.pending.is_empty()
    }

    fn finished_computation(&self) -> bool {
        self.completed.len() == self.chunk_count()
    }

    fn produce_subtask(&mut self, request: &SubtaskRequest) -> Production {
        if self.banned.contains(&request.node_id) {
            return Production::Rejected;
        }
        if self.unfinished_for_node(&request.node_id) >= self.max_per_node {
            return Production::ShouldWait;
        }
        let Some(chunk) = self.take_chunk(&request.subtask_id) else {
            return Production::ShouldWait;
        };

        self.chunk_of.insert(request.subtask_id.clone(), chunk);
        self.node_of
            .insert(request.subtask_id.clone(), request.node_id.clone());

        let (start, end) = self.bounds(chunk);
        Production::Subtask(SubtaskPayload {
            extra_data: json!({ "chunk": chunk, "start": start, "end": end }),
            short_description: format!("{} items {}..{}", self.header.task_id, start, end),
        })
    }

    fn absorb_result(&mut self, subtask_id: &str, result: TaskResult, result_dir: &Path) {
        let Some(&chunk) = self.chunk_of.get(subtask_id) else {
            tracing::debug!(subtask_id, "Result for a chunk that moved to another subtask");
            return;
        };
        let outcome = match result {
            TaskResult::Data(data) => ChunkResult {
                handles: if data.is_empty() {
                    Vec::new()
                } else {
                    vec![format!("data:{}", subtask_id)]
                },
                bytes: data.len(),
            },
            TaskResult::Files(files) => ChunkResult {
                handles: files
                    .iter()
                    .map(|f| result_dir.join(f).display().to_string())
                    .collect(),
                bytes: 0,
            },
        };
        if outcome.handles.is_empty() {
            return;
        }
        self.pending.retain(|&c| c != chunk);
        self.completed.insert(chunk, outcome);
    }

    fn computation_failed(&mut self, subtask_id: &str) {
        self.requeue(subtask_id);
        if let Some(node_id) = self.node_of.get(subtask_id) {
            self.banned.insert(node_id.clone());
        }
    }

    fn verify_subtask(&self, subtask_id: &str) -> bool {
        self.chunk_of
            .get(subtask_id)
            .and_then(|c| self.completed.get(c))
            .is_some_and(|r| !r.handles.is_empty())
    }

    fn verify_task(&self) -> bool {
        self.finished_computation() && self.completed.values().all(|r| !r.handles.is_empty())
    }

    fn progress(&self) -> f64 {
        let total = self.chunk_count();
        if total == 0 {
            return 1.0;
        }
        self.completed.len() as f64 / total as f64
    }

    fn restart(&mut self) {
        self.reset();
    }

    fn restart_subtask(&mut self, subtask_id: &str) {
        if let Some(&chunk) = self.chunk_of.get(subtask_id) {
            self.completed.remove(&chunk);
        }
        self.requeue(subtask_id);
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.pending.clear();
    }

    fn total_subtasks(&self) -> usize {
        self.chunk_count()
    }

    fn active_subtasks(&self) -> usize {
        self.chunk_count() - self.pending.len() - self.completed.len()
    }

    fn subtasks_left(&self) -> usize {
        self.chunk_count() - self.completed.len()
    }

    fn stdout(&self, subtask_id: &str) -> String {
        self.chunk_of
            .get(subtask_id)
            .and_then(|c| self.completed.get(c).map(|r| (c, r)))
            .map(|(c, r)| format!("chunk {} delivered {} bytes", c, r.bytes))
            .unwrap_or_default()
    }

    fn results(&self, subtask_id: &str) -> Vec<String> {
        self.chunk_of
            .get(subtask_id)
            .and_then(|c| self.completed.get(c))
            .map(|r| r.handles.clone())
            .unwrap_or_default()
    }

    fn resources(&self) -> Vec<PathBuf> {
        self.resources.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(subtask_id: &str, node_id: &str) -> SubtaskRequest {
        SubtaskRequest {
            subtask_id: subtask_id.to_string(),
            performance: 1000.0,
            num_cores: 2,
            node_id: node_id.to_string(),
            node_name: format!("{}-name", node_id),
        }
    }

    fn unit(total: u64, chunk: u64) -> ChunkedWorkUnit {
        ChunkedWorkUnit::new(TaskHeader::new("t1", 600.0, 60.0), total, chunk)
    }

    fn payload(p: Production) -> SubtaskPayload {
        match p {
            Production::Subtask(payload) => payload,
            other => panic!("expected a subtask, got {:?}", other),
        }
    }

    #[test]
    fn splits_range_into_chunks() {
        let mut u = unit(10, 4);
        assert_eq!(u.chunk_count(), 3);

        let p = payload(u.produce_subtask(&request("s1", "A")));
        assert_eq!(p.extra_data["start"], 0);
        assert_eq!(p.extra_data["end"], 4);

        let p = payload(u.produce_subtask(&request("s2", "B")));
        assert_eq!(p.extra_data["start"], 4);

        let p = payload(u.produce_subtask(&request("s3", "C")));
        assert_eq!(p.extra_data["end"], 10);
        assert!(!u.needs_computation());
    }

    #[test]
    fn node_waits_while_holding_a_chunk() {
        let mut u = unit(10, 2);
        payload(u.produce_subtask(&request("s1", "A")));
        assert_eq!(u.produce_subtask(&request("s2", "A")), Production::ShouldWait);

        u.absorb_result("s1", TaskResult::Data(vec![1]), Path::new("/tmp"));
        payload(u.produce_subtask(&request("s2", "A")));
    }

    #[test]
    fn failed_node_is_banned_and_chunk_requeued() {
        let mut u = unit(2, 1);
        payload(u.produce_subtask(&request("s1", "A")));
        u.computation_failed("s1");

        assert_eq!(u.produce_subtask(&request("s2", "A")), Production::Rejected);
        let p = payload(u.produce_subtask(&request("s2", "B")));
        assert_eq!(p.extra_data["chunk"], 0);
    }

    #[test]
    fn empty_result_is_not_verified() {
        let mut u = unit(1, 1);
        payload(u.produce_subtask(&request("s1", "A")));
        u.absorb_result("s1", TaskResult::Data(Vec::new()), Path::new("/tmp"));
        assert!(!u.verify_subtask("s1"));
        assert!(!u.finished_computation());
    }

    #[test]
    fn full_task_verifies() {
        let mut u = unit(4, 2);
        payload(u.produce_subtask(&request("s1", "A")));
        payload(u.produce_subtask(&request("s2", "B")));
        u.absorb_result("s1", TaskResult::Data(vec![1, 2]), Path::new("/tmp"));
        u.absorb_result(
            "s2",
            TaskResult::Files(vec![PathBuf::from("out.bin")]),
            Path::new("/res"),
        );

        assert!(u.verify_subtask("s1"));
        assert!(u.verify_subtask("s2"));
        assert!(u.finished_computation());
        assert!(u.verify_task());
        assert_eq!(u.progress(), 1.0);
        assert_eq!(u.results("s2"), vec!["/res/out.bin".to_string()]);
        assert_eq!(u.stdout("s1"), "chunk 0 delivered 2 bytes");
    }

    #[test]
    fn restarted_subtask_keeps_its_chunk() {
        let mut u = unit(4, 2);
        payload(u.produce_subtask(&request("s1", "A")));
        u.absorb_result("s1", TaskResult::Data(vec![1]), Path::new("/tmp"));
        u.restart_subtask("s1");

        assert!(!u.verify_subtask("s1"));
        assert!(u.needs_computation());

        // same id picks the same chunk back up
        let p = payload(u.produce_subtask(&request("s1", "B")));
        assert_eq!(p.extra_data["chunk"], 0);
    }

    #[test]
    fn late_result_for_restarted_id_is_absorbed() {
        let mut u = unit(2, 2);
        payload(u.produce_subtask(&request("s1", "A")));
        u.restart_subtask("s1");
        u.absorb_result("s1", TaskResult::Data(vec![7]), Path::new("/tmp"));
        assert!(u.verify_subtask("s1"));
        assert!(u.finished_computation());
    }

    #[test]
    fn abort_stops_handing_out_work() {
        let mut u = unit(10, 1);
        u.abort();
        assert!(!u.needs_computation());
        u.restart();
        assert!(u.needs_computation());
        assert_eq!(u.subtasks_left(), 10);
    }
}
