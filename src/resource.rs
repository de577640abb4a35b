//! Storage collaborators of the scheduler.
//!
//! - [`DirectoryManager`]: per-task scratch directories
//! - [`ResourceDistributor`]: content-addressed push/pull of task resources
//!
//! The node calls both outside the scheduler lock.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub trait DirectoryManager: Send + Sync {
    fn get_or_create_scratch_dir(&self, task_id: &str) -> io::Result<PathBuf>;

    /// Remove the contents of the task's scratch directory. With
    /// `keep_undeletable` set, entries marked as undeletable survive.
    fn clear_scratch(&self, task_id: &str, keep_undeletable: bool) -> io::Result<()>;
}

pub trait ResourceDistributor: Send + Sync {
    /// Publish `files` for `task_id` and return their content hash.
    fn push_resources(&self, task_id: &str, files: &[PathBuf]) -> Result<String>;

    /// Fetch the bundle identified by `hash` into `dest`.
    fn pull_resources(&self, task_id: &str, hash: &str, dest: &Path) -> Result<()>;

    fn remove_resources(&self, task_id: &str) -> Result<()>;
}

/// Scratch directories laid out as `<root>/<task_id>/tmp`.
#[derive(Debug, Clone)]
pub struct LocalDirManager {
    root: PathBuf,
    undeletable: HashSet<String>,
}

impl LocalDirManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            undeletable: HashSet::new(),
        }
    }

    /// Entry names inside a scratch directory that survive a restart.
    pub fn with_undeletable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.undeletable = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id).join("tmp")
    }
}

impl DirectoryManager for LocalDirManager {
    fn get_or_create_scratch_dir(&self, task_id: &str) -> io::Result<PathBuf> {
        let dir = self.scratch_dir(task_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn clear_scratch(&self, task_id: &str, keep_undeletable: bool) -> io::Result<()> {
        let dir = self.scratch_dir(task_id);
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep_undeletable && self.undeletable.contains(&name) {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        tracing::debug!(task_id, dir = %dir.display(), keep_undeletable, "Scratch directory cleared");
        Ok(())
    }
}
