//! Durable plan persistence.
//!
//! The store is the only writer of the plan document. Writes go through a
//! temp file in the same directory followed by an atomic rename, so a
//! concurrent reader sees either the previous document or the new one, never
//! a torn write. Callers serialize writes; the engine is the single writer by
//! contract.

use super::{Plan, Task, TaskStatus};
use crate::errors::PlanError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and schema-validate the plan document.
    pub fn read(&self) -> Result<Plan, PlanError> {
        if !self.path.exists() {
            return Err(PlanError::NotFound {
                path: self.path.clone(),
            });
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| PlanError::ReadFailed {
            path: self.path.clone(),
            source,
        })?;
        let plan: Plan =
            serde_json::from_str(&content).map_err(|source| PlanError::Unparseable {
                path: self.path.clone(),
                source,
            })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Atomic replace: serialize to a temp file beside the document, flush,
    /// then rename over it.
    pub fn write(&self, plan: &Plan) -> Result<(), PlanError> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let io_err = |source| PlanError::WriteFailed {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_string_pretty(plan).map_err(|e| PlanError::WriteFailed {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.flush().map_err(io_err)?;
        tmp.persist(&self.path)
            .map_err(|e| io_err(e.error))?;
        debug!(path = %self.path.display(), "plan document written");
        Ok(())
    }

    /// Load, validate the status transition, merge the attachment, write.
    ///
    /// Returns the updated plan so callers do not immediately re-read it.
    pub fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        last_error: Option<String>,
    ) -> Result<Plan, PlanError> {
        let mut plan = self.read()?;
        let task = plan
            .task_mut(task_id)
            .ok_or_else(|| PlanError::UnknownTask {
                id: task_id.to_string(),
            })?;

        if !task.status.can_transition_to(new_status) {
            return Err(PlanError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status,
                to: new_status,
            });
        }

        debug!(task = task_id, from = %task.status, to = %new_status, "task status transition");
        task.status = new_status;
        if let Some(err) = last_error {
            task.last_error = Some(err);
        }

        self.write(&plan)?;
        Ok(plan)
    }

    /// Tasks still awaiting execution, in plan order.
    ///
    /// `in_progress` tasks are crashed-previous-run leftovers and are included
    /// for re-attempt; checkpoint reconciliation (engine-side) runs before
    /// this when resuming, so anything still `in_progress` here genuinely
    /// never reached a terminal state.
    pub fn tasks_for_execution(plan: &Plan) -> Vec<Task> {
        plan.ordered_tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Todo | TaskStatus::InProgress))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanPhase;
    use tempfile::tempdir;

    fn sample_plan() -> Plan {
        let mut t1 = Task::new("t1", "First");
        t1.order = 0;
        let mut t2 = Task::new("t2", "Second");
        t2.order = 1;
        Plan {
            project: "demo".into(),
            phases: vec![PlanPhase {
                name: "P1".into(),
                tasks: vec!["t1".into(), "t2".into()],
                extra: serde_json::Map::new(),
            }],
            tasks: vec![t1, t2],
            extra: serde_json::Map::new(),
        }
    }

    fn store_with_plan(dir: &Path) -> PlanStore {
        let store = PlanStore::new(dir.join("plan.json"));
        store.write(&sample_plan()).unwrap();
        store
    }

    #[test]
    fn read_missing_document_is_not_found() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path().join("plan.json"));
        assert!(matches!(store.read(), Err(PlanError::NotFound { .. })));
    }

    #[test]
    fn read_garbage_is_unparseable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = PlanStore::new(&path);
        assert!(matches!(store.read(), Err(PlanError::Unparseable { .. })));
    }

    #[test]
    fn read_rejects_schema_violations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(
            &path,
            r#"{"project":"p","phases":[{"name":"P1","tasks":["ghost"]}],"tasks":[]}"#,
        )
        .unwrap();
        let store = PlanStore::new(&path);
        assert!(matches!(
            store.read(),
            Err(PlanError::UnknownTaskRef { .. })
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_with_plan(dir.path());
        let plan = store.read().unwrap();
        assert_eq!(plan.project, "demo");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.phases[0].tasks, vec!["t1", "t2"]);
    }

    #[test]
    fn write_preserves_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(
            &path,
            r#"{"project":"p","planner":"v9","phases":[],"tasks":[{"id":"t","title":"T","weight":3}]}"#,
        )
        .unwrap();
        let store = PlanStore::new(&path);
        let plan = store.read().unwrap();
        store.write(&plan).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["planner"], "v9");
        assert_eq!(raw["tasks"][0]["weight"], 3);
    }

    #[test]
    fn update_status_legal_transition_persists() {
        let dir = tempdir().unwrap();
        let store = store_with_plan(dir.path());

        let plan = store
            .update_status("t1", TaskStatus::InProgress, None)
            .unwrap();
        assert_eq!(plan.task("t1").unwrap().status, TaskStatus::InProgress);

        // And it actually reached disk.
        let reread = store.read().unwrap();
        assert_eq!(reread.task("t1").unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn update_status_attaches_error_message() {
        let dir = tempdir().unwrap();
        let store = store_with_plan(dir.path());
        store
            .update_status("t1", TaskStatus::InProgress, None)
            .unwrap();
        let plan = store
            .update_status("t1", TaskStatus::Failed, Some("provider exploded".into()))
            .unwrap();
        assert_eq!(
            plan.task("t1").unwrap().last_error.as_deref(),
            Some("provider exploded")
        );
    }

    #[test]
    fn update_status_rejects_illegal_transition() {
        let dir = tempdir().unwrap();
        let store = store_with_plan(dir.path());
        let err = store
            .update_status("t1", TaskStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition { .. }));

        // The document must be untouched after a rejected transition.
        let plan = store.read().unwrap();
        assert_eq!(plan.task("t1").unwrap().status, TaskStatus::Todo);
    }

    #[test]
    fn update_status_unknown_task_errors() {
        let dir = tempdir().unwrap();
        let store = store_with_plan(dir.path());
        assert!(matches!(
            store.update_status("nope", TaskStatus::InProgress, None),
            Err(PlanError::UnknownTask { .. })
        ));
    }

    #[test]
    fn failed_task_can_be_reattempted() {
        let dir = tempdir().unwrap();
        let store = store_with_plan(dir.path());
        store
            .update_status("t1", TaskStatus::InProgress, None)
            .unwrap();
        store
            .update_status("t1", TaskStatus::Failed, Some("boom".into()))
            .unwrap();
        let plan = store
            .update_status("t1", TaskStatus::InProgress, None)
            .unwrap();
        assert_eq!(plan.task("t1").unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn tasks_for_execution_filters_and_orders() {
        let dir = tempdir().unwrap();
        let store = store_with_plan(dir.path());
        store
            .update_status("t1", TaskStatus::InProgress, None)
            .unwrap();
        store
            .update_status("t1", TaskStatus::Completed, None)
            .unwrap();

        let plan = store.read().unwrap();
        let pending = PlanStore::tasks_for_execution(&plan);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t2");
    }

    #[test]
    fn tasks_for_execution_includes_crashed_in_progress() {
        let dir = tempdir().unwrap();
        let store = store_with_plan(dir.path());
        store
            .update_status("t1", TaskStatus::InProgress, None)
            .unwrap();

        let plan = store.read().unwrap();
        let pending = PlanStore::tasks_for_execution(&plan);
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }
}
