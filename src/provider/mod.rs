//! Provider adapters and the fallback pool.
//!
//! A provider is an external command-line assistant invoked as a subprocess:
//! `<cli> --prompt-file <path> [--<key> <value>]*`. The adapter owns the
//! prompt rendering, the invocation (timeout, process-group kill, bounded
//! capture), and the output parsing; the pool owns ordering, statistics, and
//! the circuit breaker.

pub mod adapter;
pub mod pool;

pub use adapter::{PromptContext, ProviderAdapter};
pub use pool::{CircuitState, PoolStats, ProviderPool, ProviderSuccess};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Static description of one provider: how to invoke it and with what
/// defaults. Mutable counters live in the pool, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    /// The CLI executable (resolved through PATH).
    pub command: String,
    /// Default `--key value` parameters merged into every call.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Per-call wall-clock timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            params: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Raw triple captured from a finished provider process.
#[derive(Debug, Clone)]
pub struct RawInvocation {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

/// A fenced code block extracted from provider output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// The fence info-string language, e.g. `rust`; empty when unspecified.
    pub kind: String,
    pub content: String,
    /// Target file named in the fence info string, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hint: Option<String>,
}

/// A `TOOL_CALL:` block emitted by providers that support them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub params: BTreeMap<String, String>,
}

/// Structured view of one provider response. `parse` never fails; malformed
/// output is reported through `success = false` and `error_text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_blocks: Vec<CodeBlock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub response_text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_text: String,
}

impl ParseResult {
    /// The text the validator matches acceptance criteria against.
    pub fn stringified(&self) -> &str {
        &self.response_text
    }
}
