//! Mutable state owned by one engine run.
//!
//! Everything the loop accumulates — the event log, counters, the current
//! position — lives here as plain owned fields rather than scattered
//! engine-wide mutable state, so checkpointing is a straight serialization
//! of this value plus the plan document.

use crate::cancel::CancelToken;
use crate::validate::ValidationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One provider attempt for one task, as recorded in the execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// 1-based attempt index within the task.
    pub attempt: u32,
    pub duration_ms: u64,
    pub success: bool,
    /// Redacted failure message, when the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    pub timestamp: DateTime<Utc>,
}

/// State for one run of the engine.
#[derive(Debug)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    /// Index of the task being (or about to be) executed, in plan order.
    pub current_task_index: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub log: Vec<ExecutionRecord>,
    pub recovered_from_checkpoint: bool,
    pub cancel: CancelToken,
}

impl ExecutionContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            current_task_index: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            log: Vec::new(),
            recovered_from_checkpoint: false,
            cancel,
        }
    }

    pub fn record(&mut self, record: ExecutionRecord) {
        self.log.push(record);
    }

    /// Records for one task, in attempt order.
    pub fn records_for(&self, task_id: &str) -> Vec<&ExecutionRecord> {
        self.log.iter().filter(|r| r.task_id == task_id).collect()
    }
}
