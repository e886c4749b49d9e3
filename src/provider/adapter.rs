//! One provider = one external CLI invoked as a subprocess.
//!
//! The prompt travels through a scoped temporary file (`--prompt-file`) that
//! is removed on every exit path. The child runs in its own process group so
//! a timeout or cancellation can kill the whole tree, and stdout/stderr are
//! captured up to a fixed bound while the remainder is drained so the child
//! never blocks on a full pipe.

use super::{CodeBlock, ParseResult, ProviderSpec, RawInvocation, ToolCall};
use crate::cancel::CancelToken;
use crate::errors::ProviderError;
use crate::plan::Task;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured stdout/stderr are truncated beyond this many bytes.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Health probes get a short leash regardless of the provider timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```([^\n]*)\n(.*?)```").unwrap());

/// Inputs beyond the task itself that shape the rendered prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub project: String,
    pub do_rules: Vec<String>,
    pub dont_rules: Vec<String>,
}

pub struct ProviderAdapter {
    spec: ProviderSpec,
}

impl ProviderAdapter {
    pub fn new(spec: ProviderSpec) -> Self {
        Self { spec }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    /// Render the task into a single prompt document. Deterministic for a
    /// given (task, context) pair.
    pub fn prompt(&self, task: &Task, ctx: &PromptContext) -> String {
        render_prompt(task, ctx)
    }

    /// Spawn the provider CLI with the prompt file and wait for it to exit,
    /// bounded by the provider timeout and the cancellation token.
    pub async fn invoke(
        &self,
        prompt: &str,
        overrides: &BTreeMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<RawInvocation, ProviderError> {
        // Scoped prompt file: removed when `prompt_file` drops, on every path.
        let mut prompt_file = tempfile::Builder::new()
            .prefix("conductor-prompt-")
            .suffix(".md")
            .tempfile()
            .map_err(|source| ProviderError::PromptWrite {
                provider: self.spec.name.clone(),
                source,
            })?;
        prompt_file
            .write_all(prompt.as_bytes())
            .and_then(|_| prompt_file.flush())
            .map_err(|source| ProviderError::PromptWrite {
                provider: self.spec.name.clone(),
                source,
            })?;

        let mut cmd = Command::new(&self.spec.command);
        cmd.arg("--prompt-file").arg(prompt_file.path());
        for (key, value) in merged_params(&self.spec.params, overrides) {
            cmd.arg(format!("--{}", key)).arg(value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(provider = %self.spec.name, command = %self.spec.command, "spawning provider");
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProviderError::Spawn {
            provider: self.spec.name.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe)));

        enum WaitOutcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = tokio::time::sleep(self.spec.timeout()) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let status = match outcome {
            WaitOutcome::Exited(status) => status.map_err(|source| ProviderError::Spawn {
                provider: self.spec.name.clone(),
                source,
            })?,
            WaitOutcome::TimedOut => {
                warn!(provider = %self.spec.name, timeout_secs = self.spec.timeout_secs,
                      "provider timed out; killing process group");
                kill_process_group(pid);
                let _ = child.wait().await;
                return Err(ProviderError::Timeout {
                    provider: self.spec.name.clone(),
                    timeout_secs: self.spec.timeout_secs,
                });
            }
            WaitOutcome::Cancelled => {
                warn!(provider = %self.spec.name, "run cancelled; killing provider process group");
                kill_process_group(pid);
                let _ = child.wait().await;
                return Err(ProviderError::Cancelled {
                    provider: self.spec.name.clone(),
                });
            }
        };

        let stdout = match stdout_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(RawInvocation {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }

    /// Structure the raw triple. Never fails: a malformed response comes back
    /// with `success = false` and a diagnostic in `error_text`.
    pub fn parse(&self, raw: &RawInvocation) -> ParseResult {
        let success = raw.exit_code == 0;
        let code_blocks = extract_code_blocks(&raw.stdout);
        let tool_calls = extract_tool_calls(&raw.stdout);

        let error_text = if success {
            String::new()
        } else if !raw.stderr.trim().is_empty() {
            raw.stderr.trim().to_string()
        } else if !raw.stdout.trim().is_empty() {
            raw.stdout.trim().to_string()
        } else {
            format!("provider exited with code {}", raw.exit_code)
        };

        ParseResult {
            success,
            code_blocks,
            tool_calls,
            response_text: raw.stdout.clone(),
            error_text,
        }
    }

    /// Cheap startup probe: does `<cli> --version` exit cleanly?
    pub async fn health(&self) -> bool {
        let mut cmd = Command::new(&self.spec.command);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(HEALTH_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

/// Render a task into a single prompt document. Identical across providers,
/// so the engine logs one prompt artifact per attempt.
pub fn render_prompt(task: &Task, ctx: &PromptContext) -> String {
    let mut doc = format!(
        "You are implementing one task of the \"{}\" plan.\n\n## TASK\n{}\n",
        ctx.project, task.title
    );
    if !task.description.is_empty() {
        doc.push('\n');
        doc.push_str(&task.description);
        doc.push('\n');
    }

    if !task.acceptance_criteria.is_empty() {
        doc.push_str("\n## ACCEPTANCE CRITERIA\n");
        for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
            doc.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
    }

    if !ctx.do_rules.is_empty() {
        doc.push_str("\n## DO\n");
        for rule in &ctx.do_rules {
            doc.push_str(&format!("- {}\n", rule));
        }
    }
    if !ctx.dont_rules.is_empty() {
        doc.push_str("\n## DON'T\n");
        for rule in &ctx.dont_rules {
            doc.push_str(&format!("- {}\n", rule));
        }
    }

    if !task.output_files.is_empty() {
        doc.push_str("\n## EXPECTED OUTPUT FILES\n");
        for path in &task.output_files {
            doc.push_str(&format!("- {}\n", path));
        }
    }

    if !task.check_steps.is_empty() {
        doc.push_str("\n## CHECK STEPS\nEach of these must succeed after your changes:\n");
        for (i, step) in task.check_steps.iter().enumerate() {
            match &step.expected_output {
                Some(expected) => doc.push_str(&format!(
                    "{}. `{}` (stdout must contain: \"{}\")\n",
                    i + 1,
                    step.command,
                    expected
                )),
                None => doc.push_str(&format!("{}. `{}`\n", i + 1, step.command)),
            }
        }
    }

    doc
}

/// Defaults overlaid with per-call overrides, in stable key order.
fn merged_params(
    defaults: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = defaults.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Read a pipe to EOF, keeping at most [`MAX_CAPTURE_BYTES`]. Draining past
/// the cap keeps the child from blocking on a full pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut chunk = vec![0u8; 8192];
    let mut captured: Vec<u8> = Vec::new();
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if captured.len() < MAX_CAPTURE_BYTES {
                    let take = n.min(MAX_CAPTURE_BYTES - captured.len());
                    captured.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {
    // kill_on_drop handles the direct child; grandchildren are best-effort.
}

fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    CODE_FENCE
        .captures_iter(text)
        .map(|cap| {
            let info = cap.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            let mut words = info.split_whitespace();
            let kind = words.next().unwrap_or("").to_string();
            let file_hint = words
                .map(|w| {
                    w.strip_prefix("file=")
                        .or_else(|| w.strip_prefix("path="))
                        .unwrap_or(w)
                })
                .find(|w| w.contains('/') || w.contains('.'))
                .map(str::to_string);
            let content = cap
                .get(2)
                .map(|m| m.as_str().trim_end_matches('\n').to_string())
                .unwrap_or_default();
            CodeBlock {
                kind,
                content,
                file_hint,
            }
        })
        .collect()
}

fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut current: Option<ToolCall> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("TOOL_CALL:") {
            current = Some(ToolCall {
                name: name.trim().to_string(),
                params: BTreeMap::new(),
            });
        } else if trimmed == "END_TOOL_CALL" {
            if let Some(call) = current.take()
                && !call.name.is_empty()
            {
                calls.push(call);
            }
        } else if let Some(call) = current.as_mut()
            && let Some((key, value)) = trimmed.split_once(':')
        {
            call.params
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    calls
}
