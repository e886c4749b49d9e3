//! Plan data model.
//!
//! A plan is an ordered list of phases, each naming the tasks it contains,
//! plus a flat task table. The JSON document on disk is the single source of
//! truth for task state; fields this version does not understand round-trip
//! verbatim through the flattened `extra` maps.

pub mod store;

pub use store::PlanStore;

use crate::errors::PlanError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Legal lifecycle transitions. `failed -> in_progress` allows a later
    /// run to re-attempt a failed task; completed tasks never move again.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Todo, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::InProgress)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A check-step command the validator runs in the project directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStep {
    pub command: String,
    /// Substring that must appear in the command's stdout for the step to pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

/// One unit of work dispatched to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub check_steps: Vec<CheckStep>,
    /// Paths the provider is expected to produce, absolute or project-relative.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_script: Option<PathBuf>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Ordering within the owning phase.
    #[serde(default)]
    pub order: u32,
    /// Most recent failure message, attached when the task is marked failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// Minimal task for construction in code; planner documents usually carry
    /// much more.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            check_steps: Vec::new(),
            output_files: Vec::new(),
            validation_script: None,
            status: TaskStatus::Todo,
            order: 0,
            last_error: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// An ordered group of tasks within the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    /// Task ids in declared order; every id must resolve in the task table.
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The durable plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub project: String,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Plan {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Schema validation: unique task ids, every phase reference resolves.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateTaskId {
                    id: task.id.clone(),
                });
            }
        }
        for phase in &self.phases {
            for id in &phase.tasks {
                if !seen.contains(id.as_str()) {
                    return Err(PlanError::UnknownTaskRef {
                        phase: phase.name.clone(),
                        id: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// All tasks in execution order: phases in declared order, tasks within a
    /// phase by their `order` field (declared order breaking ties).
    pub fn ordered_tasks(&self) -> Vec<&Task> {
        let mut out = Vec::new();
        for phase in &self.phases {
            let mut phase_tasks: Vec<&Task> =
                phase.tasks.iter().filter_map(|id| self.task(id)).collect();
            phase_tasks.sort_by_key(|t| t.order);
            out.extend(phase_tasks);
        }
        out
    }
}
