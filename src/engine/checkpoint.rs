//! Checkpointing and recovery.
//!
//! A checkpoint is written before every task's attempt loop begins, so the
//! latest checkpoint plus the plan document are always enough to resume
//! without repeating completed work; at worst the task that was in flight at
//! a crash runs once more. Filenames embed a timestamp that sorts
//! lexicographically in creation order, which makes "latest" a plain
//! max-by-name over the directory.

use super::context::ExecutionRecord;
use crate::plan::{Plan, TaskStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Timestamp layout used in checkpoint filenames. Zero-padded fields only,
/// so lexicographic order is creation order.
const FILENAME_TIMESTAMP: &str = "%Y-%m-%dT%H-%M-%S%.3f";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusEntry {
    pub id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub project_path: PathBuf,
    /// Path of the plan document this checkpoint belongs to.
    pub guide_path: PathBuf,
    pub current_task_index: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub tasks: Vec<TaskStatusEntry>,
    pub execution_log: Vec<ExecutionRecord>,
}

impl Checkpoint {
    /// Snapshot the engine's view of the world before the next task runs.
    pub fn capture(
        project_path: &Path,
        guide_path: &Path,
        plan: &Plan,
        current_task_index: usize,
        completed_tasks: usize,
        failed_tasks: usize,
        execution_log: &[ExecutionRecord],
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            project_path: project_path.to_path_buf(),
            guide_path: guide_path.to_path_buf(),
            current_task_index,
            completed_tasks,
            failed_tasks,
            tasks: plan
                .ordered_tasks()
                .into_iter()
                .map(|t| TaskStatusEntry {
                    id: t.id.clone(),
                    status: t.status,
                })
                .collect(),
            execution_log: execution_log.to_vec(),
        }
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .iter()
            .find(|t| t.id == task_id)
            .map(|t| t.status)
    }
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a checkpoint file; returns its path.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).context("Failed to create checkpoint directory")?;
        let filename = format!(
            "checkpoint-{}.json",
            checkpoint.timestamp.format(FILENAME_TIMESTAMP)
        );
        let path = self.dir.join(filename);
        let json =
            serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
        debug!(path = %path.display(), "checkpoint written");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Checkpoint> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))
    }

    /// All checkpoint files, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .context("Failed to read checkpoint directory")?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("checkpoint-") && n.ends_with(".json"))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// The most recent checkpoint, when any exists.
    pub fn latest(&self) -> Result<Option<(PathBuf, Checkpoint)>> {
        match self.list()?.pop() {
            Some(path) => {
                let checkpoint = Self::load(&path)?;
                Ok(Some((path, checkpoint)))
            }
            None => Ok(None),
        }
    }

    /// Remove every checkpoint file.
    pub fn clear(&self) -> Result<usize> {
        let paths = self.list()?;
        let count = paths.len();
        for path in paths {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(count)
    }
}
