//! Configuration types for orchestration, retries, validation and work units.

use core::time::Duration;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::types::{ConsensusStrategy, Stage};

/// Complete pipeline configuration.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,
    /// Stage retry policy
    pub retry: RetryConfig,
    /// Consensus engine settings
    pub validation: ValidationConfig,
    /// Validators to register with the consensus engine
    pub validators: Vec<ValidatorSpec>,
    /// Work units that may be passed to `start`
    pub work_units: Vec<WorkUnitConfig>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of work units processed concurrently (1 = sequential)
    pub unit_concurrency: usize,
    /// Maximum number of error records kept in history
    pub error_history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            unit_concurrency: 1,
            error_history_limit: 500,
        }
    }
}

/// Retry policy for transient stage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per stage, including the first
    pub max_attempts: u32,
    /// Linear backoff step in milliseconds
    pub backoff_ms: u64,
    /// Optional time budget for a single stage attempt
    pub stage_timeout_seconds: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            stage_timeout_seconds: None,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Time budget for one stage attempt, if configured.
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_seconds.map(Duration::from_secs)
    }
}

/// Consensus engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Default reconciliation strategy for the validate stage
    pub strategy: ConsensusStrategy,
    /// Upper bound on concurrently running validators per call
    pub max_workers: Option<usize>,
    /// Time budget for a single validator call
    pub validator_timeout_seconds: Option<u64>,
}

impl ValidationConfig {
    /// Time budget for one validator call, if configured.
    pub fn validator_timeout(&self) -> Option<Duration> {
        self.validator_timeout_seconds.map(Duration::from_secs)
    }
}

/// Kinds of reference validators that can be declared in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorKind {
    /// Term length bounds
    Length,
    /// Regex word blocklist
    Blocklist,
    /// Allowed categories
    Category,
    /// Minimum candidate score
    Score,
}

/// Declaration of a reference validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSpec {
    /// Unique validator name
    pub name: String,
    /// Validator implementation
    pub kind: ValidatorKind,
    /// Position in sequential chains (ascending runs first)
    #[serde(default)]
    pub priority: i32,
    /// Whether the validator participates in consensus
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum term length (length validator)
    #[serde(default)]
    pub min_length: Option<usize>,
    /// Maximum term length (length validator)
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Blocked words or patterns (blocklist validator)
    #[serde(default)]
    pub words: Vec<String>,
    /// Allowed categories (category validator)
    #[serde(default)]
    pub categories: Vec<String>,
    /// Minimum score (score validator)
    #[serde(default)]
    pub min_score: Option<f64>,
}

impl ValidatorSpec {
    /// Creates a spec with only the required fields set.
    pub fn new(name: impl Into<String>, kind: ValidatorKind, priority: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            priority,
            enabled: true,
            min_length: None,
            max_length: None,
            words: Vec::new(),
            categories: Vec::new(),
            min_score: None,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Configuration of one work unit (niche).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitConfig {
    /// Unique unit identifier
    pub id: String,
    /// Strategy override for this unit's validate stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ConsensusStrategy>,
    /// Per-stage parameters keyed by stage name
    #[serde(default)]
    pub stages: BTreeMap<String, Value>,
}

impl WorkUnitConfig {
    /// Creates a unit with no stage parameters.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            strategy: None,
            stages: BTreeMap::new(),
        }
    }

    /// Sets the parameters for one stage.
    #[must_use]
    pub fn with_stage_params(mut self, stage: Stage, params: Value) -> Self {
        self.stages.insert(stage.name().to_owned(), params);
        self
    }

    /// Sets the strategy override.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ConsensusStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Parameters configured for a stage, if any.
    pub fn stage_params(&self, stage: Stage) -> Option<&Value> {
        self.stages.get(stage.name())
    }
}

impl PipelineConfig {
    /// Get the default config directory path (`~/.seedline`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            PipelineError::Configuration("Could not determine home directory".to_owned())
        })?;
        Ok(home.join(".seedline"))
    }

    /// Get the default config file path (`~/.seedline/config.toml`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, creating it with default
    /// values if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed or created
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load and validate config from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or fails validation
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        tracing::debug!(
            "Loaded config from {:?}: {} work units, {} validators",
            path,
            config.work_units.len(),
            config.validators.len()
        );

        Ok(config)
    }

    /// Save config to a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let header = "# Seedline Configuration File\n\
                      # This file is automatically generated on first run\n\
                      # Edit this file to declare validators and work units\n\n";

        fs::write(path, format!("{header}{contents}"))?;
        Ok(())
    }

    /// Checks the configuration for values the orchestrator cannot run with.
    ///
    /// # Errors
    /// Returns a configuration error for zero concurrency, zero attempts,
    /// or duplicate unit/validator names
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.unit_concurrency == 0 {
            return Err(PipelineError::Configuration(
                "orchestrator.unit_concurrency must be at least 1".to_owned(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }

        let mut unit_ids = HashSet::new();
        for unit in &self.work_units {
            if unit.id.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "work unit id must not be empty".to_owned(),
                ));
            }
            if !unit_ids.insert(unit.id.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate work unit id: {}",
                    unit.id
                )));
            }
        }

        let mut validator_names = HashSet::new();
        for validator in &self.validators {
            if !validator_names.insert(validator.name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate validator name: {}",
                    validator.name
                )));
            }
        }

        Ok(())
    }

    /// Looks up a configured work unit by id.
    pub fn work_unit(&self, id: &str) -> Option<&WorkUnitConfig> {
        self.work_units.iter().find(|unit| unit.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.orchestrator.unit_concurrency, 1);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.validation.strategy, ConsensusStrategy::Sequential);
        assert!(config.work_units.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_linear_backoff() {
        let retry = RetryConfig {
            max_attempts: 3,
            backoff_ms: 200,
            stage_timeout_seconds: None,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(600));
        assert!(retry.stage_timeout().is_none());
    }

    #[test]
    fn test_parse_full_config() -> Result<()> {
        let toml_content = r#"
[orchestrator]
unit_concurrency = 2

[retry]
max_attempts = 4
backoff_ms = 10
stage_timeout_seconds = 30

[validation]
strategy = "majority"
validator_timeout_seconds = 5

[[validators]]
name = "length"
kind = "length"
priority = 1
min_length = 3
max_length = 40

[[validators]]
name = "blocked"
kind = "blocklist"
priority = 2
enabled = false
words = ["casino", "loan"]

[[work_units]]
id = "home-fitness"
strategy = "parallel"

[work_units.stages.collect]
seeds = ["kettlebell", "yoga mat"]
category = "fitness"
"#;

        let config: PipelineConfig = toml::from_str(toml_content)?;
        config.validate()?;

        assert_eq!(config.orchestrator.unit_concurrency, 2);
        assert_eq!(config.orchestrator.error_history_limit, 500);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.validation.strategy, ConsensusStrategy::Majority);
        assert_eq!(config.validators.len(), 2);
        assert!(config.validators[0].enabled);
        assert!(!config.validators[1].enabled);
        assert_eq!(config.validators[1].kind, ValidatorKind::Blocklist);

        let unit = config
            .work_unit("home-fitness")
            .ok_or_else(|| PipelineError::Configuration("unit missing".to_owned()))?;
        assert_eq!(unit.strategy, Some(ConsensusStrategy::Parallel));
        assert_eq!(
            unit.stage_params(Stage::Collect)
                .and_then(|params| params.get("category")),
            Some(&json!("fitness"))
        );
        assert!(unit.stage_params(Stage::Export).is_none());
        Ok(())
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = PipelineConfig {
            work_units: vec![WorkUnitConfig::new("a"), WorkUnitConfig::new("a")],
            ..PipelineConfig::default()
        };
        let error = config.validate().err();
        assert!(matches!(error, Some(PipelineError::Configuration(_))));

        let zero = PipelineConfig {
            orchestrator: OrchestratorConfig {
                unit_concurrency: 0,
                error_history_limit: 10,
            },
            ..PipelineConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("nested").join("config.toml");

        let config = PipelineConfig {
            validators: vec![ValidatorSpec::new("len", ValidatorKind::Length, 1)],
            work_units: vec![
                WorkUnitConfig::new("pets")
                    .with_stage_params(Stage::Collect, json!({ "seeds": ["cat tree"] })),
            ],
            ..PipelineConfig::default()
        };
        config.save_to_file(&path)?;

        let loaded = PipelineConfig::load_from_file(&path)?;
        assert_eq!(loaded.validators, config.validators);
        assert_eq!(loaded.work_units, config.work_units);
        Ok(())
    }
}
