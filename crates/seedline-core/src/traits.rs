//! Contracts for the external collaborators driven by the stage runner.
//!
//! The orchestrator treats these as black boxes: each consumes the previous
//! stage's output and produces the next one.

use async_trait::async_trait;

use crate::config::WorkUnitConfig;
use crate::error::Result;
use crate::types::{Artifact, Candidate};

/// Gathers raw candidates for a work unit.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Collects an ordered candidate list for `unit`.
    ///
    /// # Errors
    /// Returns [`PipelineError::TransientStage`](crate::PipelineError::TransientStage)
    /// when the source is temporarily unavailable (rate limits, timeouts).
    async fn collect(&self, unit: &WorkUnitConfig) -> Result<Vec<Candidate>>;
}

/// Turns approved candidates into an artifact.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Processes the approved candidates of `unit`.
    ///
    /// # Errors
    /// Returns an error if the artifact cannot be produced.
    async fn process(&self, unit: &WorkUnitConfig, candidates: &[Candidate]) -> Result<Artifact>;
}

/// Fills template content into a processed artifact.
#[async_trait]
pub trait Filler: Send + Sync {
    /// Produces the filled artifact.
    ///
    /// # Errors
    /// Returns an error if filling fails.
    async fn fill(&self, unit: &WorkUnitConfig, artifact: &Artifact) -> Result<Artifact>;
}

/// Exports a filled artifact.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Exports `artifact` and returns a reference to where it went.
    ///
    /// # Errors
    /// Returns an error if the export fails.
    async fn export(&self, unit: &WorkUnitConfig, artifact: &Artifact) -> Result<String>;
}
