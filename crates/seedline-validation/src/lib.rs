//! Validation consensus engine for seedline.
//!
//! Validators are pluggable capabilities that each approve a subset of a
//! candidate list. The [`ValidationConsensusEngine`] runs them under one of
//! three strategies:
//!
//! - **Sequential**: cascading filter chain in ascending priority order
//! - **Parallel**: union of every validator's independent verdict
//! - **Majority**: candidates approved by at least half of the enabled
//!   validators
//!
//! Validator failures are absorbed by the engine and never reach the caller.

/// Reference validators buildable from configuration.
pub mod builtin;
/// The consensus engine.
pub mod engine;
/// Validator and engine statistics.
pub mod stats;
/// The validator contract.
pub mod validator;

pub use builtin::{
    BlocklistRule, BlocklistValidator, CandidateRule, CategoryRule, CategoryValidator,
    LengthRule, LengthValidator, RuleValidator, ScoreRule, ScoreValidator, build_validators,
};
pub use engine::ValidationConsensusEngine;
pub use seedline_core::ConsensusStrategy;
pub use stats::{EngineStatistics, StatisticsCell, ValidatorStatistics};
pub use validator::Validator;
