//! Task validation.
//!
//! After a provider reports success, a fixed four-stage pipeline signs the
//! task off: declared output files, acceptance criteria, check-step commands,
//! and an optional custom script. Every stage always runs; the overall
//! verdict is the conjunction of the four.

pub mod pipeline;

pub use pipeline::Validator;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    OutputFiles,
    AcceptanceCriteria,
    CheckSteps,
    CustomScript,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckKind::OutputFiles => "output_files",
            CheckKind::AcceptanceCriteria => "acceptance_criteria",
            CheckKind::CheckSteps => "check_steps",
            CheckKind::CustomScript => "custom_script",
        };
        f.write_str(s)
    }
}

/// Per-item detail inside one stage (one file, one criterion, one command).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckItem {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// What one stage concluded. `Errored` means the stage crashed before it
/// could reach a verdict; it counts as not-passed but is kept distinct so
/// reports can tell "the check said no" from "the check broke".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Passed { message: String },
    Failed { message: String },
    Errored { message: String },
}

impl StageOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, StageOutcome::Passed { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            StageOutcome::Passed { message }
            | StageOutcome::Failed { message }
            | StageOutcome::Errored { message } => message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub kind: CheckKind,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<CheckItem>,
}

impl StageResult {
    pub fn passed(&self) -> bool {
        self.outcome.passed()
    }
}

/// The full verdict for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub stages: Vec<StageResult>,
    pub passed: bool,
    pub summary: String,
}

impl ValidationResult {
    pub(crate) fn from_stages(stages: Vec<StageResult>) -> Self {
        let passed = stages.iter().all(StageResult::passed);
        let summary = if passed {
            format!("all {} validation stages passed", stages.len())
        } else {
            let failed: Vec<String> = stages
                .iter()
                .filter(|s| !s.passed())
                .map(|s| format!("{}: {}", s.kind, s.outcome.message()))
                .collect();
            format!("validation failed - {}", failed.join("; "))
        };
        Self {
            stages,
            passed,
            summary,
        }
    }

    pub fn stage(&self, kind: CheckKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed_stage(kind: CheckKind) -> StageResult {
        StageResult {
            kind,
            outcome: StageOutcome::Passed {
                message: "ok".into(),
            },
            items: Vec::new(),
        }
    }

    #[test]
    fn verdict_is_conjunction_of_stages() {
        let all_passed = ValidationResult::from_stages(vec![
            passed_stage(CheckKind::OutputFiles),
            passed_stage(CheckKind::AcceptanceCriteria),
        ]);
        assert!(all_passed.passed);
        assert!(all_passed.summary.contains("passed"));

        let mut stages = vec![passed_stage(CheckKind::OutputFiles)];
        stages.push(StageResult {
            kind: CheckKind::CheckSteps,
            outcome: StageOutcome::Failed {
                message: "exit code 1".into(),
            },
            items: Vec::new(),
        });
        let failed = ValidationResult::from_stages(stages);
        assert!(!failed.passed);
        assert!(failed.summary.contains("check_steps"));
        assert!(failed.summary.contains("exit code 1"));
    }

    #[test]
    fn errored_stage_fails_the_verdict() {
        let result = ValidationResult::from_stages(vec![StageResult {
            kind: CheckKind::CustomScript,
            outcome: StageOutcome::Errored {
                message: "script timed out".into(),
            },
            items: Vec::new(),
        }]);
        assert!(!result.passed);
        assert!(result.summary.contains("script timed out"));
    }

    #[test]
    fn stage_lookup_by_kind() {
        let result = ValidationResult::from_stages(vec![
            passed_stage(CheckKind::OutputFiles),
            passed_stage(CheckKind::CustomScript),
        ]);
        assert!(result.stage(CheckKind::CustomScript).is_some());
        assert!(result.stage(CheckKind::CheckSteps).is_none());
    }
}
