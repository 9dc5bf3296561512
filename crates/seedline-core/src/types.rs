//! Data model shared by the orchestrator, stage runner and consensus engine.

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::WorkUnitConfig;
use crate::error::PipelineError;

/// One of the five ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Gather raw candidates for a work unit
    Collect,
    /// Reconcile validator verdicts on the collected candidates
    Validate,
    /// Turn approved candidates into an artifact
    Process,
    /// Fill templates/content into the processed artifact
    Fill,
    /// Export the filled artifact
    Export,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 5] = [
        Self::Collect,
        Self::Validate,
        Self::Process,
        Self::Fill,
        Self::Export,
    ];

    /// Number of stages in a unit's pipeline.
    pub const COUNT: usize = Self::ALL.len();

    /// Zero-based position of this stage in the execution order.
    pub fn index(self) -> usize {
        match self {
            Self::Collect => 0,
            Self::Validate => 1,
            Self::Process => 2,
            Self::Fill => 3,
            Self::Export => 4,
        }
    }

    /// Lowercase stage name used in config tables and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Validate => "validate",
            Self::Process => "process",
            Self::Fill => "fill",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

/// Natural key identifying a candidate: term plus category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    /// Candidate term
    pub term: String,
    /// Candidate category
    pub category: String,
}

/// An item subject to validation.
///
/// Equality of identity is defined by [`Candidate::key`]; score and metadata
/// are payload carried alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Term being proposed
    pub term: String,
    /// Category the term belongs to
    pub category: String,
    /// Optional score assigned by the collector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Free-form metadata attached by collaborators
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Candidate {
    /// Creates a candidate without score or metadata.
    pub fn new(term: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            category: category.into(),
            score: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the candidate score.
    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns the natural key of this candidate.
    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            term: self.term.clone(),
            category: self.category.clone(),
        }
    }
}

/// Removes candidates whose natural key was already seen, keeping the first
/// occurrence and the original order.
pub fn dedupe_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.key()))
        .collect()
}

/// How multiple validators' verdicts are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusStrategy {
    /// Cascading filter chain in ascending priority order
    #[default]
    Sequential,
    /// Union of every validator's independent verdict
    Parallel,
    /// Approval by at least half of the enabled validators
    Majority,
}

impl ConsensusStrategy {
    /// Lowercase strategy name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Majority => "majority",
        }
    }
}

impl fmt::Display for ConsensusStrategy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

impl FromStr for ConsensusStrategy {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "majority" => Ok(Self::Majority),
            other => Err(PipelineError::Configuration(format!(
                "unknown consensus strategy: {other}"
            ))),
        }
    }
}

/// Opaque artifact produced by the process and fill stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Kind tag chosen by the producing collaborator
    pub kind: String,
    /// Artifact body
    pub payload: Value,
}

impl Artifact {
    /// Creates a new artifact.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Outcome of one stage for one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage this result belongs to
    pub stage: Stage,
    /// Whether the stage succeeded
    pub success: bool,
    /// Wall-clock duration across all attempts in milliseconds
    pub duration_ms: u64,
    /// Number of attempts made
    pub attempts: u32,
    /// Reference to the artifact produced, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Stage-specific details (counts, strategy, error text)
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl StageResult {
    /// Creates a successful result.
    pub fn succeeded(stage: Stage, duration_ms: u64, attempts: u32) -> Self {
        Self {
            stage,
            success: true,
            duration_ms,
            attempts,
            artifact: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Creates a failed result carrying the error message.
    pub fn failed(stage: Stage, duration_ms: u64, attempts: u32, message: &str) -> Self {
        Self {
            stage,
            success: false,
            duration_ms,
            attempts,
            artifact: None,
            metadata: BTreeMap::from([("error".to_owned(), Value::from(message))]),
        }
    }

    /// Sets the artifact reference.
    #[must_use]
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Run context created, worker not yet launched
    Initializing,
    /// Worker is processing units
    Running,
    /// Worker is parked at a stage boundary
    Paused,
    /// All units processed and at least one succeeded
    Completed,
    /// Every unit failed or a fatal error aborted the run
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl RunState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the run still owns the orchestrator.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Uppercase state name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

/// Processing status of a single work unit within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    /// Not started yet
    #[default]
    Pending,
    /// Stages are executing
    Running,
    /// All stages finished successfully
    Completed,
    /// A stage failed and the unit was abandoned
    Failed,
    /// The run stopped before this unit finished
    Cancelled,
}

impl UnitStatus {
    /// Whether the unit will not change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A work unit (niche) as tracked inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Stage configuration for this unit
    pub config: WorkUnitConfig,
    /// Most recent stage started; only ever advances
    pub current_stage: Option<Stage>,
    /// Processing status
    pub status: UnitStatus,
}

impl WorkUnit {
    /// Creates a pending work unit from its configuration.
    pub fn new(config: WorkUnitConfig) -> Self {
        Self {
            config,
            current_stage: None,
            status: UnitStatus::Pending,
        }
    }

    /// Identifier of this unit.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Moves the stage pointer to `stage`.
    ///
    /// Returns `false` and leaves the pointer untouched when `stage` would
    /// rewind it.
    pub fn advance_to(&mut self, stage: Stage) -> bool {
        if self
            .current_stage
            .is_some_and(|current| stage.index() < current.index())
        {
            return false;
        }
        self.current_stage = Some(stage);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_order() {
        let indices: Vec<usize> = Stage::ALL.iter().map(|stage| stage.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(Stage::COUNT, 5);
        assert!(Stage::Collect < Stage::Export);
        assert_eq!(Stage::Fill.to_string(), "fill");
    }

    #[test]
    fn test_candidate_key_ignores_payload() {
        let first = Candidate::new("vegan snacks", "food").with_score(0.9);
        let second = Candidate::new("vegan snacks", "food").with_metadata("source", json!("x"));
        assert_eq!(first.key(), second.key());
        assert_ne!(first.key(), Candidate::new("vegan snacks", "retail").key());
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let candidates = vec![
            Candidate::new("a", "x").with_score(1.0),
            Candidate::new("b", "x"),
            Candidate::new("a", "x").with_score(2.0),
            Candidate::new("a", "y"),
        ];

        let deduped = dedupe_candidates(candidates);
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].score, Some(1.0));
        assert_eq!(deduped[1].term, "b");
        assert_eq!(deduped[2].category, "y");
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "Majority".parse::<ConsensusStrategy>().ok(),
            Some(ConsensusStrategy::Majority)
        );
        assert_eq!(
            " parallel ".parse::<ConsensusStrategy>().ok(),
            Some(ConsensusStrategy::Parallel)
        );
        assert!("unanimous".parse::<ConsensusStrategy>().is_err());
        assert_eq!(ConsensusStrategy::default(), ConsensusStrategy::Sequential);
    }

    #[test]
    fn test_run_state_flags() {
        assert!(RunState::Running.is_active());
        assert!(RunState::Paused.is_active());
        assert!(RunState::Initializing.is_active());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert_eq!(RunState::Paused.to_string(), "PAUSED");
    }

    #[test]
    fn test_work_unit_pointer_never_rewinds() {
        let mut unit = WorkUnit::new(WorkUnitConfig::new("niche"));
        assert!(unit.advance_to(Stage::Collect));
        assert!(unit.advance_to(Stage::Process));
        assert!(!unit.advance_to(Stage::Validate));
        assert_eq!(unit.current_stage, Some(Stage::Process));
        assert!(unit.advance_to(Stage::Process));
    }

    #[test]
    fn test_stage_result_builders() {
        let result = StageResult::succeeded(Stage::Export, 12, 1)
            .with_artifact("out/niche.json")
            .with_metadata("candidates", 3);
        assert!(result.success);
        assert_eq!(result.artifact.as_deref(), Some("out/niche.json"));
        assert_eq!(result.metadata.get("candidates"), Some(&json!(3)));

        let failed = StageResult::failed(Stage::Fill, 5, 3, "template missing");
        assert!(!failed.success);
        assert_eq!(failed.metadata.get("error"), Some(&json!("template missing")));
    }
}
