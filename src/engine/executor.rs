//! The execution engine.
//!
//! Drives the whole loop: select the next task in plan order, checkpoint
//! before work begins, mark the task in progress, run the provider pool with
//! classified retries and backoff, validate, persist the terminal status,
//! and narrate everything to the telemetry sinks.
//!
//! ## Persistence Ownership
//!
//! | Layer                   | What it persists                              |
//! |-------------------------|-----------------------------------------------|
//! | `plan/store.rs`         | Task statuses: the source of truth            |
//! | `engine/checkpoint.rs`  | Resume state: position, counters, event log   |
//! | `events.rs` sinks       | Observation stream; never drives control flow |
//!
//! The checkpoint written before each task, together with the plan document,
//! is sufficient to resume without repeating completed tasks.

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::context::{ExecutionContext, ExecutionRecord};
use crate::cancel::CancelToken;
use crate::classify::{backoff_delay, classify, ErrorClass};
use crate::config::Config;
use crate::errors::{PlanError, TaskExecutionError};
use crate::events::{redact, EngineEvent, EventKind, JsonlSink, Telemetry, TracingSink};
use crate::plan::{Plan, PlanStore, Task, TaskStatus};
use crate::provider::adapter::render_prompt;
use crate::provider::{ParseResult, PromptContext, ProviderAdapter, ProviderPool, ProviderSuccess};
use crate::validate::Validator;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restore position, counters, and the event log from a checkpoint.
    pub resume: bool,
    /// Resume from this checkpoint instead of the most recent one.
    pub checkpoint_path: Option<PathBuf>,
}

/// Successful terminal result of [`ExecutionEngine::execute_task`].
#[derive(Debug)]
pub struct TaskRun {
    pub task_id: String,
    pub provider: String,
    pub output: ParseResult,
    /// 1-based attempt on which the task succeeded.
    pub attempt: u32,
    pub duration: Duration,
}

/// Aggregate result of a full run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub success: bool,
    pub recovered_from_checkpoint: bool,
    pub cancelled: bool,
    pub log: Vec<ExecutionRecord>,
}

/// What the operator decided after a configuration-class terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intervention {
    Continue,
    Abort,
}

pub struct ExecutionEngine {
    config: Config,
    store: PlanStore,
    pool: ProviderPool,
    validator: Validator,
    checkpoints: CheckpointStore,
    telemetry: Telemetry,
    ctx: ExecutionContext,
    project_name: String,
}

impl ExecutionEngine {
    pub fn new(
        config: Config,
        pool: ProviderPool,
        telemetry: Telemetry,
        cancel: CancelToken,
    ) -> Self {
        let store = PlanStore::new(&config.plan_file);
        let checkpoints = CheckpointStore::new(&config.checkpoint_dir);
        let validator = Validator::new(&config.project_dir, config.check_timeout);
        Self {
            config,
            store,
            pool,
            validator,
            checkpoints,
            telemetry,
            ctx: ExecutionContext::new(cancel),
            project_name: String::new(),
        }
    }

    /// Build the pool from the configured providers (with health probes) and
    /// wire up the default sinks.
    pub async fn from_config(config: Config, cancel: CancelToken) -> Result<Self> {
        config.ensure_directories()?;
        let adapters: Vec<ProviderAdapter> = config
            .providers
            .iter()
            .cloned()
            .map(ProviderAdapter::new)
            .collect();
        let pool = ProviderPool::with_health_check(adapters).await;
        let telemetry = Telemetry::new(vec![
            Box::new(TracingSink),
            Box::new(JsonlSink::new(&config.events_file)),
        ]);
        Ok(Self::new(config, pool, telemetry, cancel))
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    fn prompt_context(&self) -> PromptContext {
        PromptContext {
            project: self.project_name.clone(),
            do_rules: self.config.do_rules.clone(),
            dont_rules: self.config.dont_rules.clone(),
        }
    }

    /// Execute one task: retries with provider fallback, validation, and the
    /// terminal status write. A cancelled task stays `in_progress` so the
    /// next run re-attempts it.
    pub async fn execute_task(&mut self, task: &Task) -> Result<TaskRun, TaskExecutionError> {
        self.mark_in_progress(task)?;

        let cancel = self.ctx.cancel.clone();
        let prompt_ctx = self.prompt_context();
        let task_start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if cancel.is_cancelled() {
                return Err(TaskExecutionError::Cancelled {
                    task_id: task.id.clone(),
                });
            }

            let outcome = if self.config.best_provider {
                self.pool
                    .execute_with_best_provider(task, &prompt_ctx, &cancel)
                    .await
            } else {
                self.pool
                    .execute_with_circuit_breaker(task, &prompt_ctx, &cancel)
                    .await
            };

            let (message, class) = match outcome {
                Ok(success) => {
                    self.emit_fallbacks(task, &success);
                    self.write_attempt_artifacts(task, attempts, &prompt_ctx, &success);

                    let execution = serde_json::json!({
                        "task_id": task.id,
                        "provider": success.provider,
                        "attempt": attempts,
                        "duration_ms": success.duration.as_millis() as u64,
                    });
                    let verdict = self
                        .validator
                        .validate(task, success.parsed.stringified(), &execution)
                        .await;

                    if verdict.passed {
                        self.ctx.record(ExecutionRecord {
                            task_id: task.id.clone(),
                            provider: Some(success.provider.clone()),
                            attempt: attempts,
                            duration_ms: success.duration.as_millis() as u64,
                            success: true,
                            error: None,
                            validation: Some(verdict),
                            timestamp: Utc::now(),
                        });
                        self.store
                            .update_status(&task.id, TaskStatus::Completed, None)?;
                        self.emit(
                            EngineEvent::new(EventKind::TaskExecution, self.ctx.run_id)
                                .task(&task.id)
                                .provider(&success.provider)
                                .detail(format!("completed on attempt {}", attempts)),
                        );
                        info!(task = %task.id, provider = %success.provider, attempt = attempts,
                              "task completed");
                        return Ok(TaskRun {
                            task_id: task.id.clone(),
                            provider: success.provider,
                            output: success.parsed,
                            attempt: attempts,
                            duration: task_start.elapsed(),
                        });
                    }

                    let message = verdict.summary.clone();
                    self.ctx.record(ExecutionRecord {
                        task_id: task.id.clone(),
                        provider: Some(success.provider.clone()),
                        attempt: attempts,
                        duration_ms: success.duration.as_millis() as u64,
                        success: false,
                        error: Some(redact(&message)),
                        validation: Some(verdict),
                        timestamp: Utc::now(),
                    });
                    (message.clone(), classify(&message))
                }
                Err(all_failed) => {
                    if cancel.is_cancelled() {
                        return Err(TaskExecutionError::Cancelled {
                            task_id: task.id.clone(),
                        });
                    }
                    self.emit_failure_fallbacks(task, &all_failed.provider_errors);
                    let message = all_failed.last_error.clone();
                    self.ctx.record(ExecutionRecord {
                        task_id: task.id.clone(),
                        provider: all_failed.provider_errors.last().map(|(p, _)| p.clone()),
                        attempt: attempts,
                        duration_ms: task_start.elapsed().as_millis() as u64,
                        success: false,
                        error: Some(redact(&message)),
                        validation: None,
                        timestamp: Utc::now(),
                    });
                    (message.clone(), classify(&message))
                }
            };

            if class.should_retry(attempts, self.config.max_retries) {
                let delay = backoff_delay(attempts - 1);
                info!(task = %task.id, attempt = attempts, class = %class,
                      delay_secs = delay.as_secs(), "attempt failed; backing off");
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(task = %task.id, attempts, class = %class, "task exhausted its attempts");
            self.store
                .update_status(&task.id, TaskStatus::Failed, Some(redact(&message)))?;
            self.emit(
                EngineEvent::new(EventKind::TaskExecution, self.ctx.run_id)
                    .task(&task.id)
                    .detail(format!("failed after {} attempt(s): {}", attempts, message)),
            );
            return Err(TaskExecutionError::Exhausted {
                task_id: task.id.clone(),
                attempts,
                class,
                message,
            });
        }
    }

    /// Run every pending task strictly in plan order, continuing past
    /// failures. Equivalent to recovery-mode execution with recovery off.
    pub async fn execute_all_tasks(&mut self) -> Result<RunSummary> {
        self.execute_all_tasks_with_recovery(RunOptions::default())
            .await
    }

    /// The canonical loop: optionally restore from a checkpoint, then write a
    /// fresh checkpoint before each task's attempt loop begins.
    pub async fn execute_all_tasks_with_recovery(
        &mut self,
        options: RunOptions,
    ) -> Result<RunSummary> {
        let run_start = Instant::now();
        let started_at = Utc::now();
        self.config.ensure_directories()?;

        let mut plan = self.store.read()?;
        if options.resume || options.checkpoint_path.is_some() {
            if let Some((path, checkpoint)) = self.load_checkpoint(&options)? {
                info!(checkpoint = %path.display(), "resuming from checkpoint");
                self.ctx.current_task_index = checkpoint.current_task_index;
                self.ctx.completed = checkpoint.completed_tasks;
                self.ctx.failed = checkpoint.failed_tasks;
                self.ctx.log = checkpoint.execution_log.clone();
                self.ctx.recovered_from_checkpoint = true;
                plan = self.reconcile(plan, &checkpoint)?;
            } else {
                warn!("resume requested but no checkpoint found; starting fresh");
            }
        }

        self.project_name = plan.project.clone();
        let ordered_ids: Vec<String> = plan
            .ordered_tasks()
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        let pending = PlanStore::tasks_for_execution(&plan);
        let total_tasks = pending.len() + self.ctx.completed + self.ctx.failed;

        self.emit(
            EngineEvent::new(EventKind::RunStart, self.ctx.run_id)
                .detail(format!("{} pending task(s)", pending.len())),
        );

        let mut cancelled = false;
        let mut aborted = false;
        let mut executed = 0usize;

        for task in &pending {
            if self.ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if aborted {
                break;
            }

            self.ctx.current_task_index = ordered_ids
                .iter()
                .position(|id| *id == task.id)
                .unwrap_or(self.ctx.current_task_index);

            // Write-before-work: the checkpoint lands on disk before the
            // task's attempt loop starts.
            let snapshot = self.store.read()?;
            let checkpoint = Checkpoint::capture(
                &self.config.project_dir,
                &self.config.plan_file,
                &snapshot,
                self.ctx.current_task_index,
                self.ctx.completed,
                self.ctx.failed,
                &self.ctx.log,
            );
            self.checkpoints.save(&checkpoint)?;

            self.emit(
                EngineEvent::new(EventKind::TaskSelection, self.ctx.run_id)
                    .task(&task.id)
                    .detail(task.title.clone()),
            );

            match self.execute_task(task).await {
                Ok(_) => {
                    executed += 1;
                    self.ctx.completed += 1;
                }
                Err(TaskExecutionError::Cancelled { .. }) => {
                    cancelled = true;
                    break;
                }
                Err(TaskExecutionError::Plan(err)) => {
                    // State and schema errors end the run.
                    return Err(err.into());
                }
                Err(err @ TaskExecutionError::Exhausted { .. }) => {
                    executed += 1;
                    self.ctx.failed += 1;
                    if err.class() == Some(ErrorClass::Configuration)
                        && self.manual_intervention(task, &err.to_string()) == Intervention::Abort
                    {
                        aborted = true;
                    }
                }
            }
        }

        let skipped = pending.len() - executed;
        self.ctx.skipped = skipped;

        // Final checkpoint: reflects the in-progress task after cancellation
        // and the terminal statuses otherwise.
        let snapshot = self.store.read()?;
        let final_checkpoint = Checkpoint::capture(
            &self.config.project_dir,
            &self.config.plan_file,
            &snapshot,
            self.ctx.current_task_index,
            self.ctx.completed,
            self.ctx.failed,
            &self.ctx.log,
        );
        self.checkpoints.save(&final_checkpoint)?;

        let summary = RunSummary {
            total_tasks,
            completed: self.ctx.completed,
            failed: self.ctx.failed,
            skipped,
            duration_ms: run_start.elapsed().as_millis() as u64,
            success: self.ctx.failed == 0 && !cancelled && !aborted,
            recovered_from_checkpoint: self.ctx.recovered_from_checkpoint,
            cancelled,
            log: self.ctx.log.clone(),
        };

        self.emit(
            EngineEvent::new(EventKind::RunCompletion, self.ctx.run_id).detail(format!(
                "completed={} failed={} skipped={} cancelled={}",
                summary.completed, summary.failed, summary.skipped, summary.cancelled
            )),
        );

        if let Err(e) = self.write_run_record(&summary, &started_at) {
            warn!(error = %e, "failed to persist run record");
        }

        Ok(summary)
    }

    fn load_checkpoint(&self, options: &RunOptions) -> Result<Option<(PathBuf, Checkpoint)>> {
        match &options.checkpoint_path {
            Some(path) => {
                let checkpoint = CheckpointStore::load(path)?;
                Ok(Some((path.clone(), checkpoint)))
            }
            None => self.checkpoints.latest(),
        }
    }

    /// A checkpoint's terminal statuses override `in_progress` leftovers in
    /// the plan: the task did finish, the process died before anyone looked.
    fn reconcile(&self, mut plan: Plan, checkpoint: &Checkpoint) -> Result<Plan, PlanError> {
        let mut changed = false;
        for task in &mut plan.tasks {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            if let Some(recorded) = checkpoint.status_of(&task.id)
                && recorded.is_terminal()
            {
                info!(task = %task.id, status = %recorded, "restoring terminal status from checkpoint");
                task.status = recorded;
                changed = true;
            }
        }
        if changed {
            self.store.write(&plan)?;
        }
        Ok(plan)
    }

    fn mark_in_progress(&mut self, task: &Task) -> Result<(), TaskExecutionError> {
        let plan = self.store.read().map_err(TaskExecutionError::Plan)?;
        let current = plan
            .task(&task.id)
            .map(|t| t.status)
            .ok_or_else(|| {
                TaskExecutionError::Plan(PlanError::UnknownTask {
                    id: task.id.clone(),
                })
            })?;
        match current {
            // A crashed previous run already moved it; re-attempt as-is.
            TaskStatus::InProgress => Ok(()),
            TaskStatus::Todo | TaskStatus::Failed => {
                self.store
                    .update_status(&task.id, TaskStatus::InProgress, None)
                    .map_err(TaskExecutionError::Plan)?;
                Ok(())
            }
            TaskStatus::Completed => Err(TaskExecutionError::Plan(PlanError::InvalidTransition {
                id: task.id.clone(),
                from: current,
                to: TaskStatus::InProgress,
            })),
        }
    }

    fn manual_intervention(&self, task: &Task, message: &str) -> Intervention {
        if self.config.non_interactive {
            info!(task = %task.id, "configuration failure in non-interactive mode; continuing");
            return Intervention::Continue;
        }
        println!(
            "  {} Task '{}' hit a configuration problem:\n    {}",
            console::style("⚠").yellow(),
            task.id,
            message
        );
        let options = &["Continue with the next task", "Abort the run"];
        let selection = dialoguer::Select::with_theme(&dialoguer::theme::ColorfulTheme::default())
            .with_prompt("Manual intervention required")
            .items(options)
            .default(0)
            .interact();
        match selection {
            Ok(1) => Intervention::Abort,
            _ => Intervention::Continue,
        }
    }

    fn emit(&mut self, event: EngineEvent) {
        self.telemetry.emit(event);
    }

    fn emit_fallbacks(&mut self, task: &Task, success: &ProviderSuccess) {
        // One event per hop: each failed provider to its successor, with the
        // winning provider closing the chain.
        let chain: Vec<(String, String)> = success.fallbacks.clone();
        for pair in chain.windows(2) {
            let (from, error) = &pair[0];
            let (to, _) = &pair[1];
            self.emit(
                EngineEvent::new(EventKind::ProviderFallback, self.ctx.run_id)
                    .task(&task.id)
                    .provider(to.clone())
                    .detail(format!("fell back from {}: {}", from, error)),
            );
        }
        if let Some((from, error)) = chain.last() {
            self.emit(
                EngineEvent::new(EventKind::ProviderFallback, self.ctx.run_id)
                    .task(&task.id)
                    .provider(&success.provider)
                    .detail(format!("fell back from {}: {}", from, error)),
            );
        }
    }

    fn emit_failure_fallbacks(&mut self, task: &Task, provider_errors: &[(String, String)]) {
        for pair in provider_errors.windows(2) {
            let (from, error) = &pair[0];
            let (to, _) = &pair[1];
            self.emit(
                EngineEvent::new(EventKind::ProviderFallback, self.ctx.run_id)
                    .task(&task.id)
                    .provider(to.clone())
                    .detail(format!("fell back from {}: {}", from, error)),
            );
        }
    }

    fn write_attempt_artifacts(
        &self,
        task: &Task,
        attempt: u32,
        prompt_ctx: &PromptContext,
        success: &ProviderSuccess,
    ) {
        let prompt_path = self
            .config
            .log_dir
            .join(format!("task-{}-attempt-{}-prompt.md", task.id, attempt));
        let output_path = self
            .config
            .log_dir
            .join(format!("task-{}-attempt-{}-output.log", task.id, attempt));
        let prompt = render_prompt(task, prompt_ctx);
        if let Err(e) = std::fs::write(&prompt_path, prompt) {
            warn!(path = %prompt_path.display(), error = %e, "failed to write prompt artifact");
        }
        if let Err(e) = std::fs::write(&output_path, &success.parsed.response_text) {
            warn!(path = %output_path.display(), error = %e, "failed to write output artifact");
        }
    }

    fn write_run_record(
        &self,
        summary: &RunSummary,
        started_at: &chrono::DateTime<Utc>,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.runs_dir)
            .context("Failed to create runs directory")?;
        let filename = format!(
            "run-{}_{}.json",
            started_at.format("%Y-%m-%dT%H-%M-%S"),
            &self.ctx.run_id.to_string()[..8]
        );
        let path = self.config.runs_dir.join(filename);
        let json = serde_json::to_string_pretty(summary).context("Failed to serialize run record")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write run record {}", path.display()))?;
        Ok(path)
    }
}
