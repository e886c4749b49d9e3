//! Engine event stream.
//!
//! The engine narrates a run through a narrow sink interface: one `emit`
//! call per event. Sinks are observation only and never drive control flow.
//! Redaction happens here, before any sink sees an event, so neither log
//! files nor external collectors receive secrets or home-directory paths.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::LazyLock;
use uuid::Uuid;

// Long unbroken token-ish runs (API keys, bearer tokens, hashes).
static LONG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_\-]{40,}").unwrap());

// Vendor-style key prefixes, which are worth catching even when short.
static KEY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:sk|pk|api|key)-[A-Za-z0-9_\-]{8,}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    TaskSelection,
    TaskExecution,
    ProviderFallback,
    RunCompletion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EngineEvent {
    pub fn new(kind: EventKind, run_id: Uuid) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            run_id,
            task_id: None,
            provider: None,
            detail: None,
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Scrub secrets and home-directory prefixes out of free text.
pub fn redact(text: &str) -> String {
    let mut out = LONG_TOKEN.replace_all(text, "[REDACTED]").into_owned();
    out = KEY_PREFIX.replace_all(&out, "[REDACTED]").into_owned();
    if let Some(home) = dirs::home_dir() {
        let home = home.to_string_lossy();
        if !home.is_empty() {
            out = out.replace(home.as_ref(), "~");
        }
    }
    out
}

/// Narrow sink interface: a single `emit` operation.
pub trait TelemetrySink: Send {
    fn emit(&mut self, event: &EngineEvent);
}

/// Applies redaction and forwards to the configured sinks.
pub struct Telemetry {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl Telemetry {
    pub fn new(sinks: Vec<Box<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub fn disabled() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn emit(&mut self, mut event: EngineEvent) {
        if let Some(detail) = event.detail.take() {
            event.detail = Some(redact(&detail));
        }
        for sink in &mut self.sinks {
            sink.emit(&event);
        }
    }
}

/// Logs each event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&mut self, event: &EngineEvent) {
        tracing::info!(
            kind = ?event.kind,
            task = event.task_id.as_deref().unwrap_or("-"),
            provider = event.provider.as_deref().unwrap_or("-"),
            detail = event.detail.as_deref().unwrap_or(""),
            "engine event"
        );
    }
}

/// Appends one JSON document per line to a file. Write failures are logged
/// and dropped; telemetry must never take the run down.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TelemetrySink for JsonlSink {
    fn emit(&mut self, event: &EngineEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append event");
        }
    }
}

/// Collects events in memory; the engine tests read them back. Clones share
/// the same underlying buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: std::sync::Arc<std::sync::Mutex<Vec<EngineEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the recorded events, usable after the sink is boxed.
    pub fn events(&self) -> std::sync::Arc<std::sync::Mutex<Vec<EngineEvent>>> {
        self.events.clone()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&mut self, event: &EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
