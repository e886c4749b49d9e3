//! Typed error hierarchy for the Conductor engine.
//!
//! Four top-level enums cover the subsystems:
//! - `PlanError` — plan-document schema and status-transition failures
//! - `ProviderError` — single-adapter invocation failures
//! - `ValidationError` — a validation stage crashed (distinct from "not passed")
//! - `TaskExecutionError` — terminal outcome of a task's attempt loop
//!
//! `PlanError` propagates to the top level and ends the run; provider and
//! validation errors are caught by the engine to drive retry/fallback.

use crate::classify::ErrorClass;
use crate::plan::TaskStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the plan store: missing/malformed documents and illegal
/// task-status transitions.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan document not found at {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read plan document at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse plan document at {path}: {source}")]
    Unparseable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate task id '{id}' in plan document")]
    DuplicateTaskId { id: String },

    #[error("Phase '{phase}' references unknown task id '{id}'")]
    UnknownTaskRef { phase: String, id: String },

    #[error("Task '{id}' not found in plan")]
    UnknownTask { id: String },

    #[error("Invalid status transition for task '{id}': {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Failed to write plan document at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a single provider invocation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider '{provider}' timed out after {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    #[error("Failed to spawn provider '{provider}': {source}")]
    Spawn {
        provider: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provider '{provider}' exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        provider: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Failed to parse output from provider '{provider}': {message}")]
    ParseFailure { provider: String, message: String },

    #[error("Failed to write prompt file for provider '{provider}': {source}")]
    PromptWrite {
        provider: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Run cancelled while provider '{provider}' was executing")]
    Cancelled { provider: String },
}

impl ProviderError {
    /// Flat message used by the classifier and per-provider error lists.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

/// Every provider in the pool was skipped or failed for one task.
#[derive(Debug, Error)]
#[error("All providers failed for task '{task_id}': {last_error}")]
pub struct AllProvidersFailed {
    pub task_id: String,
    /// The most recent provider error, verbatim.
    pub last_error: String,
    /// (provider name, error message) in attempt order.
    pub provider_errors: Vec<(String, String)>,
}

/// A validation stage crashed before producing a verdict. The pipeline maps
/// this onto a failed stage; it never unwinds the run loop.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Check command '{command}' timed out after {timeout_secs}s")]
    CheckTimeout { command: String, timeout_secs: u64 },

    #[error("Failed to run check command '{command}': {source}")]
    CheckSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Custom validation script '{script}' timed out after {timeout_secs}s")]
    ScriptTimeout { script: String, timeout_secs: u64 },

    #[error("Failed to run custom validation script '{script}': {source}")]
    ScriptSpawn {
        script: String,
        #[source]
        source: std::io::Error,
    },
}

/// Terminal outcome of a task's attempt loop, raised by `execute_task` after
/// retries and fallback are exhausted.
#[derive(Debug, Error)]
pub enum TaskExecutionError {
    #[error("Task '{task_id}' failed after {attempts} attempt(s) [{class}]: {message}")]
    Exhausted {
        task_id: String,
        attempts: u32,
        class: ErrorClass,
        message: String,
    },

    #[error("Run cancelled before task '{task_id}' reached a terminal state")]
    Cancelled { task_id: String },

    #[error(transparent)]
    Plan(#[from] PlanError),
}

impl TaskExecutionError {
    /// The classified error type, when the task genuinely exhausted its
    /// attempts. Cancellation and plan-store failures carry no class.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            TaskExecutionError::Exhausted { class, .. } => Some(*class),
            _ => None,
        }
    }
}
