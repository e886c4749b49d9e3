//! Sequential task execution.
//!
//! This module owns the single-threaded execution path: one task at a time,
//! strictly in plan order, with per-task retries and cross-provider fallback.
//! Tasks are never overlapped and at most one child process runs at a time.
//!
//! Recovery happens at task granularity: a checkpoint is written before each
//! task's attempt loop begins, so the worst case after a crash is one task
//! re-executed.

pub mod checkpoint;
pub mod context;
pub mod executor;

pub use checkpoint::{Checkpoint, CheckpointStore, TaskStatusEntry};
pub use context::{ExecutionContext, ExecutionRecord};
pub use executor::{ExecutionEngine, Intervention, RunOptions, RunSummary, TaskRun};
