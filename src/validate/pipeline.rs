//! The four validation stages.
//!
//! Check-step commands and the custom script run through `sh -c` with the
//! project directory as the working directory, under the validator's own
//! timeout (separate from the provider timeout). A stage that crashes turns
//! into `StageOutcome::Errored`; the remaining stages still run.

use super::{CheckItem, CheckKind, StageOutcome, StageResult, ValidationResult};
use crate::errors::ValidationError;
use crate::plan::Task;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Custom scripts must print a single JSON document shaped like this.
#[derive(Debug, serde::Deserialize)]
struct ScriptVerdict {
    passed: bool,
    #[serde(default)]
    message: Option<String>,
}

pub struct Validator {
    project_dir: PathBuf,
    check_timeout: Duration,
}

impl Validator {
    pub fn new(project_dir: impl Into<PathBuf>, check_timeout: Duration) -> Self {
        Self {
            project_dir: project_dir.into(),
            check_timeout,
        }
    }

    /// Run all four stages and conjoin their verdicts.
    ///
    /// `provider_output` is the stringified provider response the acceptance
    /// criteria are matched against; `execution` is the JSON-serialised
    /// execution result handed to the custom script.
    pub async fn validate(
        &self,
        task: &Task,
        provider_output: &str,
        execution: &serde_json::Value,
    ) -> ValidationResult {
        let stages = vec![
            self.check_output_files(task),
            self.check_acceptance_criteria(task, provider_output),
            self.run_check_steps(task).await,
            self.run_custom_script(task, execution).await,
        ];
        let result = ValidationResult::from_stages(stages);
        debug!(task = %task.id, passed = result.passed, "validation finished");
        result
    }

    fn check_output_files(&self, task: &Task) -> StageResult {
        if task.output_files.is_empty() {
            return StageResult {
                kind: CheckKind::OutputFiles,
                outcome: StageOutcome::Passed {
                    message: "no output files declared".into(),
                },
                items: Vec::new(),
            };
        }

        let mut items = Vec::new();
        for declared in &task.output_files {
            let path = self.resolve(declared);
            match std::fs::metadata(&path) {
                Ok(meta) => {
                    let modified = meta
                        .modified()
                        .ok()
                        .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                        .unwrap_or_else(|| "unknown".into());
                    items.push(CheckItem {
                        name: declared.clone(),
                        passed: true,
                        detail: format!("{} bytes, modified {}", meta.len(), modified),
                    });
                }
                Err(_) => items.push(CheckItem {
                    name: declared.clone(),
                    passed: false,
                    detail: format!("missing: {}", path.display()),
                }),
            }
        }

        let missing = items.iter().filter(|i| !i.passed).count();
        let outcome = if missing == 0 {
            StageOutcome::Passed {
                message: format!("all {} output files present", items.len()),
            }
        } else {
            StageOutcome::Failed {
                message: format!("{} of {} output files missing", missing, items.len()),
            }
        };
        StageResult {
            kind: CheckKind::OutputFiles,
            outcome,
            items,
        }
    }

    fn check_acceptance_criteria(&self, task: &Task, provider_output: &str) -> StageResult {
        if task.acceptance_criteria.is_empty() {
            return StageResult {
                kind: CheckKind::AcceptanceCriteria,
                outcome: StageOutcome::Passed {
                    message: "no acceptance criteria declared".into(),
                },
                items: Vec::new(),
            };
        }

        let items: Vec<CheckItem> = task
            .acceptance_criteria
            .iter()
            .map(|criterion| {
                let found = provider_output.contains(criterion.as_str());
                CheckItem {
                    name: criterion.clone(),
                    passed: found,
                    detail: if found {
                        "found in provider output".into()
                    } else {
                        "not found in provider output".into()
                    },
                }
            })
            .collect();

        let unmet = items.iter().filter(|i| !i.passed).count();
        let outcome = if unmet == 0 {
            StageOutcome::Passed {
                message: format!("all {} acceptance criteria met", items.len()),
            }
        } else {
            StageOutcome::Failed {
                message: format!("{} of {} acceptance criteria unmet", unmet, items.len()),
            }
        };
        StageResult {
            kind: CheckKind::AcceptanceCriteria,
            outcome,
            items,
        }
    }

    async fn run_check_steps(&self, task: &Task) -> StageResult {
        if task.check_steps.is_empty() {
            return StageResult {
                kind: CheckKind::CheckSteps,
                outcome: StageOutcome::Passed {
                    message: "no check steps declared".into(),
                },
                items: Vec::new(),
            };
        }

        let mut items = Vec::new();
        let mut crashed: Option<ValidationError> = None;

        for step in &task.check_steps {
            match self.run_command(&step.command).await {
                Ok(run) => {
                    let exit_ok = run.exit_code == 0;
                    let output_ok = step
                        .expected_output
                        .as_ref()
                        .is_none_or(|expected| run.stdout.contains(expected.as_str()));
                    let passed = exit_ok && output_ok;
                    let detail = if passed {
                        format!("exit 0 in {:.1}s", run.duration.as_secs_f64())
                    } else if !exit_ok {
                        format!(
                            "exit {} in {:.1}s: {}",
                            run.exit_code,
                            run.duration.as_secs_f64(),
                            truncate(&run.stderr, 200)
                        )
                    } else {
                        format!(
                            "expected output {:?} not found in stdout",
                            step.expected_output.as_deref().unwrap_or_default()
                        )
                    };
                    items.push(CheckItem {
                        name: step.command.clone(),
                        passed,
                        detail,
                    });
                }
                Err(err) => {
                    items.push(CheckItem {
                        name: step.command.clone(),
                        passed: false,
                        detail: err.to_string(),
                    });
                    crashed.get_or_insert(err);
                }
            }
        }

        let failed = items.iter().filter(|i| !i.passed).count();
        let outcome = match crashed {
            Some(err) => StageOutcome::Errored {
                message: err.to_string(),
            },
            None if failed == 0 => StageOutcome::Passed {
                message: format!("all {} check steps passed", items.len()),
            },
            None => StageOutcome::Failed {
                message: format!("{} of {} check steps failed", failed, items.len()),
            },
        };
        StageResult {
            kind: CheckKind::CheckSteps,
            outcome,
            items,
        }
    }

    async fn run_custom_script(&self, task: &Task, execution: &serde_json::Value) -> StageResult {
        let Some(script) = &task.validation_script else {
            return StageResult {
                kind: CheckKind::CustomScript,
                outcome: StageOutcome::Passed {
                    message: "no custom validation script declared".into(),
                },
                items: Vec::new(),
            };
        };

        let script_path = self.resolve(&script.to_string_lossy());
        if !script_path.exists() {
            return StageResult {
                kind: CheckKind::CustomScript,
                outcome: StageOutcome::Failed {
                    message: format!("validation script not found: {}", script_path.display()),
                },
                items: Vec::new(),
            };
        }

        let execution_json = execution.to_string();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script_path.to_string_lossy().as_ref())
            .current_dir(&self.project_dir)
            .env("CONDUCTOR_TASK_ID", &task.id)
            .env("CONDUCTOR_TASK_TITLE", &task.title)
            .env("CONDUCTOR_EXECUTION_RESULT", &execution_json)
            .env("CONDUCTOR_PROJECT_PATH", &self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let script_name = script_path.display().to_string();
        let output = match tokio::time::timeout(self.check_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return StageResult {
                    kind: CheckKind::CustomScript,
                    outcome: StageOutcome::Errored {
                        message: ValidationError::ScriptSpawn {
                            script: script_name,
                            source,
                        }
                        .to_string(),
                    },
                    items: Vec::new(),
                };
            }
            Err(_) => {
                return StageResult {
                    kind: CheckKind::CustomScript,
                    outcome: StageOutcome::Errored {
                        message: ValidationError::ScriptTimeout {
                            script: script_name,
                            timeout_secs: self.check_timeout.as_secs(),
                        }
                        .to_string(),
                    },
                    items: Vec::new(),
                };
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let outcome = match serde_json::from_str::<ScriptVerdict>(stdout.trim()) {
            Ok(verdict) => {
                let message = verdict
                    .message
                    .unwrap_or_else(|| "custom script verdict".into());
                if verdict.passed {
                    StageOutcome::Passed { message }
                } else {
                    StageOutcome::Failed { message }
                }
            }
            Err(parse_err) => StageOutcome::Failed {
                message: format!(
                    "script output is not a valid verdict ({}): {}",
                    parse_err,
                    truncate(stdout.trim(), 200)
                ),
            },
        };

        StageResult {
            kind: CheckKind::CustomScript,
            outcome,
            items: Vec::new(),
        }
    }

    async fn run_command(&self, command: &str) -> Result<CommandRun, ValidationError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let output = match tokio::time::timeout(self.check_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ValidationError::CheckSpawn {
                    command: command.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(ValidationError::CheckTimeout {
                    command: command.to_string(),
                    timeout_secs: self.check_timeout.as_secs(),
                });
            }
        };

        Ok(CommandRun {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }

    fn resolve(&self, declared: &str) -> PathBuf {
        let path = Path::new(declared);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

struct CommandRun {
    exit_code: i32,
    stdout: String,
    stderr: String,
    duration: Duration,
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
