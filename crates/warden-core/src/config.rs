//! Configuration for the Warden governance loop.
//!
//! Load order: built-in defaults, then an optional TOML file, then `WARDEN_*`
//! environment overrides. `validate()` runs last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
    #[error("Validation failed for {field}: {reason}")]
    ValidationError { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WardenConfig {
    pub supervisor: SupervisorConfig,
    pub evaluator: EvaluatorConfig,
    pub voting: VotingConfig,
    pub evidence: EvidenceConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Agent that owns the supervised runs.
    pub agent_id: String,
    /// Worker argv; `--lr <rate>` is appended at launch.
    pub worker_command: Vec<String>,
    pub default_learning_rate: f64,
    /// Grace period between SIGTERM and SIGKILL.
    pub shutdown_timeout_secs: u64,
    /// Run the worker under `nice -n 10` when `nice` is available.
    pub low_priority: bool,
    /// Holds `pids/<run_id>.pid`.
    pub state_dir: PathBuf,
    /// Bound of the step → evaluator queue.
    pub eval_queue_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_id: "synth-1".to_string(),
            worker_command: vec![
                "python3".to_string(),
                "trainer/tinygrad_train.py".to_string(),
            ],
            default_learning_rate: 0.01,
            shutdown_timeout_secs: 5,
            low_priority: true,
            state_dir: PathBuf::from(".warden"),
            eval_queue_capacity: 64,
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Scope of the "human review pending" guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardScope {
    /// Any automatic proposal of the category in human review blocks evaluation.
    Category,
    /// Only a proposal raised for the same run blocks evaluation.
    Run,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub window_size: usize,
    /// Fractional improvement required to approve (0.20 = 20%).
    pub improvement_threshold: f64,
    /// Below this a veto also triggers a retrain.
    pub retrain_improvement_threshold: f64,
    pub learning_rate_decay: f64,
    pub min_learning_rate: f64,
    /// Voter id the evaluator votes as.
    pub reviewer_id: String,
    pub category: String,
    pub guard_scope: GuardScope,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            improvement_threshold: 0.20,
            retrain_improvement_threshold: 0.10,
            learning_rate_decay: 0.8,
            min_learning_rate: 1e-5,
            reviewer_id: "synth-1".to_string(),
            category: "lr-tuning".to_string(),
            guard_scope: GuardScope::Category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    pub total_reviewers: u32,
    pub quorum_threshold: f64,
    pub approval_threshold: f64,
    /// Fixed automated reviewer identities. Empty accepts any voter id.
    pub reviewer_pool: Vec<String>,
    pub reviewer_timeout_secs: u64,
    pub human_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Execute approved proposals as soon as they finalize.
    pub auto_execute: bool,
    /// Command that receives an approved diff on stdin. `None` uses a no-op executor.
    pub executor_command: Option<Vec<String>>,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            total_reviewers: 3,
            quorum_threshold: 2.0 / 3.0,
            approval_threshold: 2.0 / 3.0,
            reviewer_pool: Vec::new(),
            reviewer_timeout_secs: 30 * 60,
            human_timeout_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
            auto_execute: false,
            executor_command: None,
        }
    }
}

impl VotingConfig {
    pub fn reviewer_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reviewer_timeout_secs as i64)
    }

    pub fn human_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.human_timeout_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub root: PathBuf,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("public/evidence/compliance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `mem://`, `surrealkv://<path>` or a remote endpoint.
    pub url: String,
    pub namespace: String,
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "warden".to_string(),
            database: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: "info".to_string(),
        }
    }
}

impl WardenConfig {
    /// Load configuration.
    ///
    /// With `path = None`, `warden.toml` in the working directory is used if
    /// present. An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides_from(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file on top of the defaults, without env overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `WARDEN_*` overrides read through `lookup`.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: var.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("WARDEN_AGENT_ID") {
            self.supervisor.agent_id = v;
        }
        if let Some(v) = lookup("WARDEN_WORKER_COMMAND") {
            self.supervisor.worker_command = v.split_whitespace().map(String::from).collect();
        }
        if let Some(v) = lookup("WARDEN_LEARNING_RATE") {
            self.supervisor.default_learning_rate = parsed("WARDEN_LEARNING_RATE", v)?;
        }
        if let Some(v) = lookup("WARDEN_STATE_DIR") {
            self.supervisor.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WARDEN_LOW_PRIORITY") {
            self.supervisor.low_priority = parsed("WARDEN_LOW_PRIORITY", v)?;
        }
        if let Some(v) = lookup("WARDEN_WINDOW_SIZE") {
            self.evaluator.window_size = parsed("WARDEN_WINDOW_SIZE", v)?;
        }
        if let Some(v) = lookup("WARDEN_TOTAL_REVIEWERS") {
            self.voting.total_reviewers = parsed("WARDEN_TOTAL_REVIEWERS", v)?;
        }
        if let Some(v) = lookup("WARDEN_QUORUM_THRESHOLD") {
            self.voting.quorum_threshold = parsed("WARDEN_QUORUM_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("WARDEN_APPROVAL_THRESHOLD") {
            self.voting.approval_threshold = parsed("WARDEN_APPROVAL_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("WARDEN_AUTO_EXECUTE") {
            self.voting.auto_execute = parsed("WARDEN_AUTO_EXECUTE", v)?;
        }
        if let Some(v) = lookup("WARDEN_EVIDENCE_ROOT") {
            self.evidence.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("WARDEN_STORAGE_URL") {
            self.storage.url = v;
        }
        if let Some(v) = lookup("WARDEN_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("WARDEN_LOG_JSON") {
            self.logging.json = parsed("WARDEN_LOG_JSON", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.supervisor;
        if s.agent_id.trim().is_empty() {
            return Err(invalid("supervisor.agent_id", "must not be empty"));
        }
        if s.worker_command.is_empty() {
            return Err(invalid("supervisor.worker_command", "must not be empty"));
        }
        if !(s.default_learning_rate.is_finite() && s.default_learning_rate > 0.0) {
            return Err(invalid("supervisor.default_learning_rate", "must be positive"));
        }
        if s.shutdown_timeout_secs == 0 {
            return Err(invalid("supervisor.shutdown_timeout_secs", "must be greater than 0"));
        }
        if s.eval_queue_capacity == 0 {
            return Err(invalid("supervisor.eval_queue_capacity", "must be greater than 0"));
        }

        let e = &self.evaluator;
        if e.window_size < 2 {
            return Err(invalid("evaluator.window_size", "must be at least 2"));
        }
        if !(e.improvement_threshold > 0.0 && e.improvement_threshold <= 1.0) {
            return Err(invalid("evaluator.improvement_threshold", "must be in (0, 1]"));
        }
        if !(e.retrain_improvement_threshold >= 0.0
            && e.retrain_improvement_threshold <= e.improvement_threshold)
        {
            return Err(invalid(
                "evaluator.retrain_improvement_threshold",
                "must be between 0 and improvement_threshold",
            ));
        }
        if !(e.learning_rate_decay > 0.0 && e.learning_rate_decay < 1.0) {
            return Err(invalid("evaluator.learning_rate_decay", "must be in (0, 1)"));
        }
        if !(e.min_learning_rate > 0.0) {
            return Err(invalid("evaluator.min_learning_rate", "must be positive"));
        }
        if e.reviewer_id.trim().is_empty() {
            return Err(invalid("evaluator.reviewer_id", "must not be empty"));
        }

        let v = &self.voting;
        if v.total_reviewers == 0 {
            return Err(invalid("voting.total_reviewers", "must be greater than 0"));
        }
        for (field, value) in [
            ("voting.quorum_threshold", v.quorum_threshold),
            ("voting.approval_threshold", v.approval_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(field, "must be in (0, 1]"));
            }
        }
        if !v.reviewer_pool.is_empty() {
            if v.reviewer_pool.len() != v.total_reviewers as usize {
                return Err(invalid(
                    "voting.reviewer_pool",
                    "must list exactly total_reviewers identities",
                ));
            }
            let mut seen = std::collections::HashSet::new();
            if !v.reviewer_pool.iter().all(|r| seen.insert(r)) {
                return Err(invalid("voting.reviewer_pool", "identities must be unique"));
            }
            if !v.reviewer_pool.contains(&e.reviewer_id) {
                return Err(invalid(
                    "voting.reviewer_pool",
                    "must include evaluator.reviewer_id",
                ));
            }
        }
        if v.reviewer_timeout_secs == 0 || v.human_timeout_secs == 0 {
            return Err(invalid("voting", "phase timeouts must be greater than 0"));
        }
        if v.sweep_interval_secs == 0 {
            return Err(invalid("voting.sweep_interval_secs", "must be greater than 0"));
        }
        if matches!(&v.executor_command, Some(cmd) if cmd.is_empty()) {
            return Err(invalid("voting.executor_command", "must not be empty when set"));
        }

        if self.storage.url.trim().is_empty() {
            return Err(invalid("storage.url", "must not be empty"));
        }
        Ok(())
    }

    /// The defaults rendered as TOML.
    pub fn sample_toml() -> String {
        toml::to_string_pretty(&WardenConfig::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = WardenConfig::default();
        config.validate().unwrap();
        assert_eq!(config.supervisor.agent_id, "synth-1");
        assert_eq!(config.evaluator.window_size, 5);
        assert_eq!(config.voting.total_reviewers, 3);
        assert_eq!(config.voting.reviewer_timeout_secs, 1800);
        assert_eq!(config.evidence.root, PathBuf::from("public/evidence/compliance"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WardenConfig::from_toml_str(
            r#"
            [voting]
            total_reviewers = 5

            [evaluator]
            guard_scope = "run"
            "#,
        )
        .unwrap();
        assert_eq!(config.voting.total_reviewers, 5);
        assert_eq!(config.voting.human_timeout_secs, 86400);
        assert_eq!(config.evaluator.guard_scope, GuardScope::Run);
        assert_eq!(config.evaluator.window_size, 5);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WARDEN_AGENT_ID", "synth-9"),
            ("WARDEN_WORKER_COMMAND", "sh -c ./train.sh"),
            ("WARDEN_QUORUM_THRESHOLD", "0.5"),
            ("WARDEN_AUTO_EXECUTE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = WardenConfig::default();
        config
            .apply_env_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.supervisor.agent_id, "synth-9");
        assert_eq!(config.supervisor.worker_command, vec!["sh", "-c", "./train.sh"]);
        assert_eq!(config.voting.quorum_threshold, 0.5);
        assert!(config.voting.auto_execute);
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let mut config = WardenConfig::default();
        let err = config
            .apply_env_overrides_from(|k| (k == "WARDEN_TOTAL_REVIEWERS").then(|| "three".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == "WARDEN_TOTAL_REVIEWERS"));
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = WardenConfig::default();
        config.voting.approval_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { ref field, .. }) if field == "voting.approval_threshold"
        ));

        let mut config = WardenConfig::default();
        config.evaluator.retrain_improvement_threshold = 0.3;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.voting.reviewer_pool = vec!["a".into(), "b".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_toml_parses_back() {
        let sample = WardenConfig::sample_toml();
        let parsed = WardenConfig::from_toml_str(&sample).unwrap();
        assert_eq!(parsed, WardenConfig::default());
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = WardenConfig::load(Some(Path::new("/nonexistent/warden.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
