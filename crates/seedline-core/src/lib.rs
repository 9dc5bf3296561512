//! Core types and traits for the seedline candidate pipeline.
//!
//! This crate provides the data model shared by every other crate in the
//! workspace: pipeline stages, candidates, work units, stage results, run
//! states, the error taxonomy, the TOML configuration, and the collaborator
//! contracts for the collect/process/fill/export stages.

/// Configuration types loaded from TOML.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Collaborator contracts for the non-validation stages.
pub mod traits;
/// Core data types for candidates, stages and work units.
pub mod types;

pub use config::{
    OrchestratorConfig, PipelineConfig, RetryConfig, ValidationConfig, ValidatorKind,
    ValidatorSpec, WorkUnitConfig,
};
pub use error::{ErrorClass, PipelineError, Result};
pub use traits::{Collector, Exporter, Filler, Processor};
pub use types::{
    Artifact, Candidate, CandidateKey, ConsensusStrategy, RunState, Stage, StageResult,
    UnitStatus, WorkUnit, dedupe_candidates,
};
