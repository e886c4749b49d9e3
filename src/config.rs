//! Runtime configuration for Conductor.
//!
//! Settings live in `conductor.toml` at the project root; this module bridges
//! that file into the runtime `Config` the engine consumes: resolved paths
//! under `.conductor/`, provider specs, retry limits, and the two
//! environment flags that force non-interactive behaviour.

use crate::provider::ProviderSpec;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment flag forcing the manual-intervention hook to answer
/// "continue" without prompting.
pub const NON_INTERACTIVE_ENV: &str = "CONDUCTOR_NON_INTERACTIVE";

/// Continuous-integration contexts get the same treatment.
pub const CI_ENV: &str = "CI";

/// `conductor.toml` as written by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    pub engine: EngineSection,
    pub providers: Vec<ProviderSpec>,
    pub rules: RulesSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_retries: u32,
    pub check_timeout_secs: u64,
    /// Order providers by observed success rate instead of configured order.
    pub best_provider: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: crate::classify::DEFAULT_MAX_RETRIES,
            check_timeout_secs: 60,
            best_provider: false,
        }
    }
}

/// Do/don't constraints injected into every prompt.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RulesSection {
    #[serde(rename = "do")]
    pub do_rules: Vec<String>,
    #[serde(rename = "dont")]
    pub dont_rules: Vec<String>,
}

impl ConductorToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub plan_file: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub events_file: PathBuf,
    pub providers: Vec<ProviderSpec>,
    pub max_retries: u32,
    pub check_timeout: Duration,
    pub best_provider: bool,
    pub do_rules: Vec<String>,
    pub dont_rules: Vec<String>,
    pub non_interactive: bool,
    pub verbose: bool,
}

impl Config {
    /// Load `conductor.toml` (if present) and resolve the directory layout.
    pub fn load(project_dir: PathBuf, plan_file: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let toml_path = project_dir.join("conductor.toml");
        let settings = if toml_path.exists() {
            ConductorToml::load(&toml_path)?
        } else {
            ConductorToml::default()
        };

        let conductor_dir = project_dir.join(".conductor");
        let plan_file = match plan_file {
            Some(path) if path.is_absolute() => path,
            Some(path) => project_dir.join(path),
            None => conductor_dir.join("plan.json"),
        };

        let providers = if settings.providers.is_empty() {
            vec![ProviderSpec::new("claude", "claude")]
        } else {
            settings.providers
        };

        Ok(Self {
            project_dir,
            plan_file,
            checkpoint_dir: conductor_dir.join("checkpoints"),
            log_dir: conductor_dir.join("logs"),
            runs_dir: conductor_dir.join("runs"),
            events_file: conductor_dir.join("events.jsonl"),
            providers,
            max_retries: settings.engine.max_retries,
            check_timeout: Duration::from_secs(settings.engine.check_timeout_secs),
            best_provider: settings.engine.best_provider,
            do_rules: settings.rules.do_rules,
            dont_rules: settings.rules.dont_rules,
            non_interactive: non_interactive_from_env(),
            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)
            .context("Failed to create checkpoint directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        Ok(())
    }
}

fn env_flag_set(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// True when either control flag forces non-interactive behaviour.
pub fn non_interactive_from_env() -> bool {
    env_flag_set(NON_INTERACTIVE_ENV) || env_flag_set(CI_ENV)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_without_conductor_toml() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), None, false).unwrap();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.check_timeout, Duration::from_secs(60));
        assert!(!config.best_provider);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].name, "claude");
        assert!(config.plan_file.ends_with(".conductor/plan.json"));
        assert!(config.checkpoint_dir.ends_with(".conductor/checkpoints"));
    }

    #[test]
    fn parses_full_conductor_toml() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("conductor.toml"),
            r#"
[engine]
max_retries = 5
check_timeout_secs = 120
best_provider = true

[rules]
do = ["write tests first"]
dont = ["edit generated files"]

[[providers]]
name = "claude"
command = "claude"
timeout_secs = 600

[providers.params]
model = "sonnet"

[[providers]]
name = "aider"
command = "aider"
"#,
        )
        .unwrap();

        let config = Config::load(dir.path().to_path_buf(), None, true).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.check_timeout, Duration::from_secs(120));
        assert!(config.best_provider);
        assert_eq!(config.do_rules, vec!["write tests first"]);
        assert_eq!(config.dont_rules, vec!["edit generated files"]);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].timeout_secs, 600);
        assert_eq!(config.providers[0].params["model"], "sonnet");
        assert_eq!(config.providers[1].name, "aider");
        assert_eq!(config.providers[1].timeout_secs, 300);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("conductor.toml"), "[engine\nmax_retries = ").unwrap();
        let result = Config::load(dir.path().to_path_buf(), None, false);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse")
        );
    }

    #[test]
    fn relative_plan_override_resolves_under_project() {
        let dir = tempdir().unwrap();
        let config = Config::load(
            dir.path().to_path_buf(),
            Some(PathBuf::from("docs/plan.json")),
            false,
        )
        .unwrap();
        assert!(config.plan_file.ends_with("docs/plan.json"));
        assert!(config.plan_file.starts_with(&config.project_dir));
    }

    #[test]
    fn ensure_directories_creates_layout() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), None, false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.checkpoint_dir.exists());
        assert!(config.log_dir.exists());
        assert!(config.runs_dir.exists());
    }
}
